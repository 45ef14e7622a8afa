//! DHT/UDP tracker interaction task
//!
//! DHT and the UDP tracker client share one socket. Each turn this task
//! drains the socket, routes every datagram to its protocol, expires
//! timeouts on both sides and flushes their outgoing traffic.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use tracing::debug;

use super::connection::DhtConnection;
use super::dispatcher::DhtMessageDispatcher;
use super::receiver::DhtMessageReceiver;
use super::task_queue::DhtTaskQueue;
use crate::engine::{EngineContext, Execute, TaskStatus};
use crate::error::Result;
use crate::torrent::udp_tracker::{UdpTrackerClient, UdpTrackerError};
use crate::types::Cuid;

/// Receive buffer; no DHT or tracker datagram comes close to it
const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Which protocol a datagram on the shared socket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    Dht,
    UdpTracker,
}

/// KRPC messages are bencoded dictionaries, so they start with `d`.
/// Tracker replies start with a big-endian action number, whose first byte
/// is zero for every defined action.
pub fn classify_datagram(data: &[u8]) -> DatagramKind {
    match data.first() {
        Some(b'd') => DatagramKind::Dht,
        _ => DatagramKind::UdpTracker,
    }
}

pub struct DhtInteractionTask {
    cuid: Cuid,
    connection: Box<dyn DhtConnection>,
    receiver: DhtMessageReceiver,
    dispatcher: Rc<RefCell<DhtMessageDispatcher>>,
    task_queue: DhtTaskQueue,
    udp_tracker: Rc<RefCell<UdpTrackerClient>>,
    buf: Box<[u8]>,
}

impl std::fmt::Debug for DhtInteractionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtInteractionTask")
            .field("cuid", &self.cuid)
            .field("background_tasks", &self.task_queue.len())
            .finish()
    }
}

impl DhtInteractionTask {
    pub fn new(
        cuid: Cuid,
        connection: Box<dyn DhtConnection>,
        receiver: DhtMessageReceiver,
        dispatcher: Rc<RefCell<DhtMessageDispatcher>>,
        task_queue: DhtTaskQueue,
        udp_tracker: Rc<RefCell<UdpTrackerClient>>,
    ) -> Self {
        Self {
            cuid,
            connection,
            receiver,
            dispatcher,
            task_queue,
            udp_tracker,
            buf: vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    pub fn udp_tracker(&self) -> &Rc<RefCell<UdpTrackerClient>> {
        &self.udp_tracker
    }

    fn receive_datagrams(&mut self, now: Instant) {
        loop {
            let (len, from) = match self.connection.receive_message(&mut self.buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    debug!("DHT socket read failed: {}", e);
                    break;
                }
            };
            if len == 0 {
                break;
            }
            let data = &self.buf[..len];
            let result = match classify_datagram(data) {
                DatagramKind::Dht => self.receiver.receive_message(data, from, now),
                DatagramKind::UdpTracker => {
                    self.udp_tracker.borrow_mut().receive_reply(data, from, now)
                }
            };
            if let Err(e) = result {
                debug!("Dropping datagram from {}: {}", from, e);
            }
        }
    }

    fn send_tracker_requests(&mut self, now: Instant) {
        let mut tracker = self.udp_tracker.borrow_mut();
        while tracker.has_pending() {
            let Some((len, remote)) = tracker.create_request(&mut self.buf, now) else {
                break;
            };
            match self.connection.send_message(&self.buf[..len], remote) {
                Ok(_) => tracker.request_sent(now),
                Err(e) => {
                    debug!("UDP tracker send to {} failed: {}", remote, e);
                    tracker.request_fail(UdpTrackerError::Network);
                }
            }
        }
    }
}

impl Execute for DhtInteractionTask {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "DhtInteraction"
    }

    fn execute(&mut self, cx: &mut EngineContext) -> Result<TaskStatus> {
        if cx.groups().download_finished()
            || (cx.is_halt_requested() && self.udp_tracker.borrow().num_watchers() == 0)
        {
            return Ok(TaskStatus::Finished);
        }
        if cx.is_force_halt_requested() {
            self.udp_tracker.borrow_mut().fail_all();
            return Ok(TaskStatus::Finished);
        }

        let now = cx.now();
        self.task_queue.execute_tasks(now);

        self.receive_datagrams(now);

        self.receiver.handle_timeout(now);
        self.udp_tracker.borrow_mut().handle_timeout(now);

        let failed = self
            .dispatcher
            .borrow_mut()
            .send_messages(self.connection.as_mut(), now);
        for callback in failed {
            callback(None);
        }

        self.send_tracker_requests(now);

        Ok(TaskStatus::Continue)
    }

    fn deadline(&self, cx: &EngineContext) -> Option<Instant> {
        let busy = self.dispatcher.borrow().count_message_in_queue() > 0
            || self.udp_tracker.borrow().has_pending();
        busy.then(|| cx.now())
    }

    fn release(&mut self, cx: &mut EngineContext) {
        if let Err(e) = self.connection.deregister(cx.reactor_mut()) {
            debug!("Failed to deregister DHT socket: {}", e);
        }
        cx.reactor_mut().forget_task(self.cuid);
    }
}
