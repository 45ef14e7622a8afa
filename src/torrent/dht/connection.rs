//! The UDP socket shared by the DHT and the UDP tracker client

use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;
use mio::{Interest, Token};

use crate::engine::Reactor;
use crate::types::Cuid;

/// Datagram transport used by the DHT interaction task
pub trait DhtConnection {
    /// Read one datagram. `Ok(None)` when nothing is queued.
    fn receive_message(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn send_message(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Ask the reactor to wake task `cuid` on readability
    fn register(&mut self, _reactor: &mut Reactor, _cuid: Cuid) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _reactor: &mut Reactor) -> io::Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Non-blocking UDP socket
pub struct UdpDhtConnection {
    socket: UdpSocket,
    token: Option<Token>,
}

impl UdpDhtConnection {
    /// Bind on all interfaces. Port 0 picks an ephemeral port.
    pub fn bind(port: u16) -> io::Result<Self> {
        Self::bind_addr(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    pub fn bind_addr(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr)?,
            token: None,
        })
    }
}

impl DhtConnection for UdpDhtConnection {
    fn receive_message(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_message(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    fn register(&mut self, reactor: &mut Reactor, cuid: Cuid) -> io::Result<()> {
        let token = reactor.register(&mut self.socket, cuid, Interest::READABLE)?;
        self.token = Some(token);
        Ok(())
    }

    fn deregister(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        match self.token.take() {
            Some(token) => reactor.deregister(&mut self.socket, token),
            None => Ok(()),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}
