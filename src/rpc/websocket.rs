//! WebSocket upgrade and session tasks

use std::time::Instant;

use tracing::{debug, info};

use super::{HttpServerConnection, WebSocketSession};
use crate::engine::{EngineContext, Execute, TaskStatus};
use crate::error::{EngineError, NetworkErrorKind, Result};
use crate::types::Cuid;

/// Sends the `101 Switching Protocols` response, then hands the socket to
/// a [`WebSocketInteractionTask`] under the same cuid
pub struct WebSocketResponseTask {
    cuid: Cuid,
    connection: Option<Box<dyn HttpServerConnection>>,
    started: Option<Instant>,
    handed_off: bool,
}

impl WebSocketResponseTask {
    pub fn new(cuid: Cuid, connection: Box<dyn HttpServerConnection>) -> Self {
        Self {
            cuid,
            connection: Some(connection),
            started: None,
            handed_off: false,
        }
    }
}

impl Execute for WebSocketResponseTask {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "WebSocketResponse"
    }

    fn execute(&mut self, cx: &mut EngineContext) -> Result<TaskStatus> {
        if cx.is_halt_requested() {
            return Ok(TaskStatus::Finished);
        }
        let now = cx.now();
        let started = *self.started.get_or_insert(now);
        let timeout = cx.config().timeout();
        if now.saturating_duration_since(started) >= timeout {
            return Err(EngineError::network(
                NetworkErrorKind::Timeout,
                "WebSocket upgrade response not sent in time",
            ));
        }

        let Some(connection) = self.connection.as_mut() else {
            return Ok(TaskStatus::Finished);
        };
        if !connection.send_response()? {
            return Ok(TaskStatus::Continue);
        }

        if let Some(connection) = self.connection.take() {
            let session = connection.into_websocket();
            cx.spawn(WebSocketInteractionTask::new(self.cuid, session));
            self.handed_off = true;
            info!("#{} WebSocket session established", self.cuid);
        }
        Ok(TaskStatus::Finished)
    }

    fn release(&mut self, cx: &mut EngineContext) {
        // The interaction task now owns the cuid and its registrations
        if self.handed_off {
            return;
        }
        if let Some(connection) = self.connection.as_mut() {
            connection.deregister(cx.reactor_mut());
        }
        cx.reactor_mut().forget_task(self.cuid);
    }
}

/// Drives a WebSocket session until it closes or the engine halts
pub struct WebSocketInteractionTask {
    cuid: Cuid,
    session: Box<dyn WebSocketSession>,
}

impl WebSocketInteractionTask {
    pub fn new(cuid: Cuid, session: Box<dyn WebSocketSession>) -> Self {
        Self { cuid, session }
    }
}

impl Execute for WebSocketInteractionTask {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "WebSocketInteraction"
    }

    fn execute(&mut self, cx: &mut EngineContext) -> Result<TaskStatus> {
        if cx.is_halt_requested() {
            return Ok(TaskStatus::Finished);
        }
        self.session.receive()?;
        self.session.send()?;
        if self.session.is_closed() {
            debug!("#{} WebSocket session closed", self.cuid);
            return Ok(TaskStatus::Finished);
        }
        Ok(TaskStatus::Continue)
    }

    fn deadline(&self, cx: &EngineContext) -> Option<Instant> {
        self.session.wants_write().then(|| cx.now())
    }

    fn release(&mut self, cx: &mut EngineContext) {
        self.session.deregister(cx.reactor_mut());
        cx.reactor_mut().forget_task(self.cuid);
    }
}
