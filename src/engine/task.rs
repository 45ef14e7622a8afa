//! Scheduled tasks
//!
//! Every unit of work the engine drives is one variant of [`Task`]. The
//! engine calls [`Execute::execute`] once per turn; a task that returns
//! [`TaskStatus::Continue`] runs again next turn, one that returns
//! [`TaskStatus::Finished`] (or an error) is released and dropped.

use std::time::Instant;

use super::EngineContext;
use crate::error::{EngineError, Result};
use crate::group::activation::GroupActivationTask;
use crate::rpc::websocket::{WebSocketInteractionTask, WebSocketResponseTask};
use crate::stream::{StreamInitiateTask, StreamTransferTask};
use crate::torrent::dht::DhtInteractionTask;
use crate::types::Cuid;

/// Outcome of one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Drop the task
    Finished,
    /// Run again next turn
    Continue,
}

/// The contract every task variant implements
pub trait Execute {
    /// Call id, unique per engine
    fn cuid(&self) -> Cuid;

    /// Short label for logs
    fn name(&self) -> &'static str;

    /// Do one turn's worth of non-blocking work
    fn execute(&mut self, cx: &mut EngineContext) -> Result<TaskStatus>;

    /// Earliest instant this task wants to run again without socket
    /// readiness. `None` means no timer of its own.
    fn deadline(&self, _cx: &EngineContext) -> Option<Instant> {
        None
    }

    /// Called after `execute` returned an error, before release
    fn fail(&mut self, _cx: &mut EngineContext, _err: &EngineError) {}

    /// Called once when the task is dropped
    fn release(&mut self, cx: &mut EngineContext) {
        cx.reactor_mut().forget_task(self.cuid());
    }
}

/// Closed set of scheduled work
pub enum Task {
    GroupActivation(GroupActivationTask),
    StreamInitiate(StreamInitiateTask),
    StreamTransfer(StreamTransferTask),
    DhtInteraction(DhtInteractionTask),
    WebSocketResponse(WebSocketResponseTask),
    WebSocketInteraction(WebSocketInteractionTask),
}

macro_rules! dispatch {
    ($self:expr, $task:ident => $body:expr) => {
        match $self {
            Task::GroupActivation($task) => $body,
            Task::StreamInitiate($task) => $body,
            Task::StreamTransfer($task) => $body,
            Task::DhtInteraction($task) => $body,
            Task::WebSocketResponse($task) => $body,
            Task::WebSocketInteraction($task) => $body,
        }
    };
}

impl Execute for Task {
    fn cuid(&self) -> Cuid {
        dispatch!(self, t => t.cuid())
    }

    fn name(&self) -> &'static str {
        dispatch!(self, t => t.name())
    }

    fn execute(&mut self, cx: &mut EngineContext) -> Result<TaskStatus> {
        dispatch!(self, t => t.execute(cx))
    }

    fn deadline(&self, cx: &EngineContext) -> Option<Instant> {
        dispatch!(self, t => t.deadline(cx))
    }

    fn fail(&mut self, cx: &mut EngineContext, err: &EngineError) {
        dispatch!(self, t => t.fail(cx, err))
    }

    fn release(&mut self, cx: &mut EngineContext) {
        dispatch!(self, t => t.release(cx))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name(), self.cuid())
    }
}

impl From<GroupActivationTask> for Task {
    fn from(t: GroupActivationTask) -> Self {
        Task::GroupActivation(t)
    }
}

impl From<StreamInitiateTask> for Task {
    fn from(t: StreamInitiateTask) -> Self {
        Task::StreamInitiate(t)
    }
}

impl From<StreamTransferTask> for Task {
    fn from(t: StreamTransferTask) -> Self {
        Task::StreamTransfer(t)
    }
}

impl From<DhtInteractionTask> for Task {
    fn from(t: DhtInteractionTask) -> Self {
        Task::DhtInteraction(t)
    }
}

impl From<WebSocketResponseTask> for Task {
    fn from(t: WebSocketResponseTask) -> Self {
        Task::WebSocketResponse(t)
    }
}

impl From<WebSocketInteractionTask> for Task {
    fn from(t: WebSocketInteractionTask) -> Self {
        Task::WebSocketInteraction(t)
    }
}
