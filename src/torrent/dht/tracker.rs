//! Outstanding KRPC queries, matched by transaction id

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::message::{DhtMessage, DhtResponse, TransactionId};
use super::node::NodeId;

/// Invoked with the reply, or `None` on timeout or send failure
pub type DhtCallback = Box<dyn FnOnce(Option<&DhtResponse>)>;

pub struct TrackedQuery {
    pub transaction_id: TransactionId,
    pub addr: SocketAddr,
    /// Remote node id if known when the query was sent
    pub node_id: Option<NodeId>,
    pub method: &'static str,
    deadline: Instant,
    callback: Option<DhtCallback>,
}

impl TrackedQuery {
    /// Run the callback once
    pub fn complete(&mut self, response: Option<&DhtResponse>) {
        if let Some(callback) = self.callback.take() {
            callback(response);
        }
    }
}

impl std::fmt::Debug for TrackedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedQuery")
            .field("transaction_id", &self.transaction_id)
            .field("addr", &self.addr)
            .field("method", &self.method)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct DhtMessageTracker {
    entries: Vec<TrackedQuery>,
}

impl DhtMessageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_message(
        &mut self,
        transaction_id: TransactionId,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        method: &'static str,
        timeout: Duration,
        callback: Option<DhtCallback>,
        now: Instant,
    ) {
        self.entries.push(TrackedQuery {
            transaction_id,
            addr,
            node_id,
            method,
            deadline: now + timeout,
            callback,
        });
    }

    /// Take the query `msg` answers. The source address must match the
    /// address the query went to.
    pub fn message_arrived(&mut self, msg: &DhtMessage, from: SocketAddr) -> Option<TrackedQuery> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.transaction_id == msg.transaction_id && e.addr == from)?;
        Some(self.entries.remove(pos))
    }

    /// Take every query whose deadline has passed
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<TrackedQuery> {
        let (expired, live): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entries)
                .into_iter()
                .partition(|e| now >= e.deadline);
        self.entries = live;
        expired
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_match_requires_address() {
        let now = Instant::now();
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let mut tracker = DhtMessageTracker::new();
        tracker.add_message(b"aa".to_vec(), addr, None, "ping", Duration::from_secs(10), None, now);

        let reply = DhtMessage::response(b"aa".to_vec(), NodeId([1u8; 20]), DhtResponse::default());
        assert!(tracker
            .message_arrived(&reply, "10.0.0.2:6881".parse().unwrap())
            .is_none());
        let entry = tracker.message_arrived(&reply, addr).unwrap();
        assert_eq!(entry.method, "ping");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_timeout_fires_callback_with_none() {
        let now = Instant::now();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let mut tracker = DhtMessageTracker::new();
        tracker.add_message(
            b"bb".to_vec(),
            "10.0.0.1:6881".parse().unwrap(),
            None,
            "find_node",
            Duration::from_secs(10),
            Some(Box::new(move |resp: Option<&DhtResponse>| {
                flag.set(resp.is_none())
            })),
            now,
        );

        assert!(tracker.handle_timeout(now + Duration::from_secs(5)).is_empty());
        let mut expired = tracker.handle_timeout(now + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        expired[0].complete(None);
        assert!(fired.get());
        assert_eq!(tracker.count(), 0);
    }
}
