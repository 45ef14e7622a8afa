//! Outgoing KRPC queue

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::connection::DhtConnection;
use super::message::{DhtMessage, DhtMessageBody, DhtQuery, TransactionId};
use super::node::NodeId;
use super::tracker::{DhtCallback, DhtMessageTracker};

struct Outgoing {
    message: DhtMessage,
    addr: SocketAddr,
    node_id: Option<NodeId>,
    callback: Option<DhtCallback>,
}

pub struct DhtMessageDispatcher {
    our_id: NodeId,
    queue: VecDeque<Outgoing>,
    tracker: Rc<RefCell<DhtMessageTracker>>,
    timeout: Duration,
    next_transaction: u16,
}

impl DhtMessageDispatcher {
    pub fn new(our_id: NodeId, tracker: Rc<RefCell<DhtMessageTracker>>, timeout: Duration) -> Self {
        Self {
            our_id,
            queue: VecDeque::new(),
            tracker,
            timeout,
            next_transaction: rand::random(),
        }
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    fn new_transaction_id(&mut self) -> TransactionId {
        self.next_transaction = self.next_transaction.wrapping_add(1);
        self.next_transaction.to_be_bytes().to_vec()
    }

    /// Queue a query under a fresh transaction id; it is tracked once sent
    pub fn add_query(
        &mut self,
        query: DhtQuery,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        callback: Option<DhtCallback>,
    ) -> TransactionId {
        let transaction_id = self.new_transaction_id();
        let message = DhtMessage::query(transaction_id.clone(), self.our_id, query);
        self.queue.push_back(Outgoing {
            message,
            addr,
            node_id,
            callback,
        });
        transaction_id
    }

    /// Queue a reply or error
    pub fn add_message(&mut self, message: DhtMessage, addr: SocketAddr) {
        self.queue.push_back(Outgoing {
            message,
            addr,
            node_id: None,
            callback: None,
        });
    }

    /// Send as much of the queue as the socket accepts.
    ///
    /// Returns the callbacks of queries whose send failed; the caller runs
    /// them with `None` once the dispatcher is no longer borrowed.
    pub fn send_messages(&mut self, conn: &mut dyn DhtConnection, now: Instant) -> Vec<DhtCallback> {
        let mut failed = Vec::new();
        while let Some(front) = self.queue.front() {
            let data = front.message.encode();
            match conn.send_message(&data, front.addr) {
                Ok(_) => {
                    let Some(sent) = self.queue.pop_front() else {
                        break;
                    };
                    if let DhtMessageBody::Query(query) = &sent.message.body {
                        self.tracker.borrow_mut().add_message(
                            sent.message.transaction_id.clone(),
                            sent.addr,
                            sent.node_id,
                            query.method(),
                            self.timeout,
                            sent.callback,
                            now,
                        );
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Failed to send DHT message to {}: {}", front.addr, e);
                    if let Some(callback) = self.queue.pop_front().and_then(|o| o.callback) {
                        failed.push(callback);
                    }
                }
            }
        }
        failed
    }

    pub fn count_message_in_queue(&self) -> usize {
        self.queue.len()
    }
}
