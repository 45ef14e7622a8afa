//! RPC transport seams
//!
//! The RPC request surface lives outside the engine. What the engine drives
//! is the socket side: an HTTP server connection that finishes sending its
//! upgrade response, then a WebSocket session on the same socket.

pub mod websocket;

use crate::engine::Reactor;
use crate::error::Result;
use crate::types::Cuid;

pub use websocket::{WebSocketInteractionTask, WebSocketResponseTask};

/// Server side of one accepted HTTP connection
pub trait HttpServerConnection {
    /// Push buffered response bytes. True once the whole response is out.
    fn send_response(&mut self) -> Result<bool>;

    fn register(&mut self, _reactor: &mut Reactor, _cuid: Cuid) -> Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _reactor: &mut Reactor) {}

    /// Turn the upgraded connection into a WebSocket session. The socket
    /// and its reactor registration carry over.
    fn into_websocket(self: Box<Self>) -> Box<dyn WebSocketSession>;
}

/// A WebSocket session driven one step per turn
pub trait WebSocketSession {
    /// Read and handle whatever frames have arrived
    fn receive(&mut self) -> Result<()>;

    /// Flush queued outgoing frames
    fn send(&mut self) -> Result<()>;

    /// True once a close frame went either way or the peer hung up
    fn is_closed(&self) -> bool;

    /// Outgoing frames are queued
    fn wants_write(&self) -> bool {
        false
    }

    fn deregister(&mut self, _reactor: &mut Reactor) {}
}
