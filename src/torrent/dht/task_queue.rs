//! Background DHT maintenance: bootstrap and bucket refresh

use std::cell::RefCell;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::dispatcher::DhtMessageDispatcher;
use super::message::DhtQuery;
use super::node::NodeId;
use super::routing::{RoutingTable, K};
use crate::error::Result;

/// Pause between bootstrap lookup rounds
pub const BOOTSTRAP_ROUND_INTERVAL: Duration = Duration::from_secs(5);

const BOOTSTRAP_ROUNDS: u8 = 3;
const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state a background task works on
pub struct DhtTaskContext {
    pub routing: Rc<RefCell<RoutingTable>>,
    pub dispatcher: Rc<RefCell<DhtMessageDispatcher>>,
}

impl DhtTaskContext {
    fn our_id(&self) -> NodeId {
        *self.routing.borrow().our_id()
    }

    /// Send find_node(target) to the closest known good nodes
    fn lookup(&self, target: NodeId, now: Instant) -> usize {
        let closest = self.routing.borrow().find_closest(&target, K, now);
        let mut dispatcher = self.dispatcher.borrow_mut();
        for node in &closest {
            dispatcher.add_query(DhtQuery::FindNode { target }, node.addr, Some(node.id), None);
        }
        closest.len()
    }
}

/// Populate the routing table from the configured entry points
#[derive(Debug)]
pub struct BootstrapTask {
    entry_points: Vec<String>,
    round: u8,
    next_round_at: Option<Instant>,
}

impl BootstrapTask {
    pub fn new(entry_points: Vec<String>) -> Self {
        Self {
            entry_points,
            round: 0,
            next_round_at: None,
        }
    }

    fn resolve(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for entry in &self.entry_points {
            match entry.to_socket_addrs() {
                Ok(resolved) => addrs.extend(resolved.filter(SocketAddr::is_ipv4)),
                Err(e) => debug!("Failed to resolve DHT entry point {}: {}", entry, e),
            }
        }
        addrs
    }

    /// True once bootstrap is over
    fn execute(&mut self, cx: &DhtTaskContext, now: Instant) -> Result<bool> {
        if self.next_round_at.is_some_and(|at| now < at) {
            return Ok(false);
        }

        let our_id = cx.our_id();
        if self.round == 0 {
            let addrs = self.resolve();
            if addrs.is_empty() && cx.routing.borrow().node_count() == 0 {
                warn!("No DHT entry point could be resolved");
                return Ok(true);
            }
            let mut dispatcher = cx.dispatcher.borrow_mut();
            for addr in addrs {
                dispatcher.add_query(DhtQuery::FindNode { target: our_id }, addr, None, None);
            }
        } else if self.round < BOOTSTRAP_ROUNDS {
            let sent = cx.lookup(our_id, now);
            debug!("DHT bootstrap round {}: {} queries", self.round, sent);
        } else {
            info!(
                "DHT bootstrap finished with {} nodes",
                cx.routing.borrow().node_count()
            );
            return Ok(true);
        }

        self.round += 1;
        self.next_round_at = Some(now + BOOTSTRAP_ROUND_INTERVAL);
        Ok(false)
    }
}

/// Refresh buckets that have not changed for `interval`
#[derive(Debug)]
pub struct BucketRefreshTask {
    interval: Duration,
    next_check_at: Instant,
}

impl BucketRefreshTask {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_check_at: now + interval.min(REFRESH_CHECK_INTERVAL),
        }
    }

    fn execute(&mut self, cx: &DhtTaskContext, now: Instant) -> Result<bool> {
        if now < self.next_check_at {
            return Ok(false);
        }
        self.next_check_at = now + self.interval.min(REFRESH_CHECK_INTERVAL);

        let stale = cx.routing.borrow().stale_buckets(now, self.interval);
        let our_id = cx.our_id();
        for idx in stale {
            cx.routing.borrow_mut().touch_bucket(idx, now);
            let target = our_id.random_in_bucket(idx);
            let sent = cx.lookup(target, now);
            debug!("Refreshing DHT bucket {}: {} queries", idx, sent);
        }
        Ok(false)
    }
}

#[derive(Debug)]
pub enum DhtTask {
    Bootstrap(BootstrapTask),
    BucketRefresh(BucketRefreshTask),
}

impl DhtTask {
    fn name(&self) -> &'static str {
        match self {
            DhtTask::Bootstrap(_) => "bootstrap",
            DhtTask::BucketRefresh(_) => "bucket refresh",
        }
    }

    fn execute(&mut self, cx: &DhtTaskContext, now: Instant) -> Result<bool> {
        match self {
            DhtTask::Bootstrap(t) => t.execute(cx, now),
            DhtTask::BucketRefresh(t) => t.execute(cx, now),
        }
    }
}

pub struct DhtTaskQueue {
    cx: DhtTaskContext,
    tasks: Vec<DhtTask>,
}

impl DhtTaskQueue {
    pub fn new(
        routing: Rc<RefCell<RoutingTable>>,
        dispatcher: Rc<RefCell<DhtMessageDispatcher>>,
    ) -> Self {
        Self {
            cx: DhtTaskContext {
                routing,
                dispatcher,
            },
            tasks: Vec::new(),
        }
    }

    pub fn add_task(&mut self, task: DhtTask) {
        self.tasks.push(task);
    }

    /// Run every due task; finished and failed ones are dropped
    pub fn execute_tasks(&mut self, now: Instant) {
        let cx = &self.cx;
        self.tasks.retain_mut(|task| match task.execute(cx, now) {
            Ok(finished) => !finished,
            Err(e) => {
                warn!("DHT {} task failed: {}", task.name(), e);
                false
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::dht::connection::DhtConnection;
    use crate::torrent::dht::message::{DhtMessage, DhtMessageBody};
    use crate::torrent::dht::node::DhtNode;
    use crate::torrent::dht::tracker::DhtMessageTracker;
    use std::io;

    #[derive(Default)]
    struct Capture(Vec<(Vec<u8>, SocketAddr)>);

    impl DhtConnection for Capture {
        fn receive_message(&mut self, _: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
            Ok(None)
        }

        fn send_message(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.0.push((data.to_vec(), addr));
            Ok(data.len())
        }
    }

    fn queue(now: Instant) -> (DhtTaskQueue, Rc<RefCell<RoutingTable>>, Rc<RefCell<DhtMessageDispatcher>>) {
        let our_id = NodeId([0x10; 20]);
        let routing = Rc::new(RefCell::new(RoutingTable::new(our_id, now)));
        let tracker = Rc::new(RefCell::new(DhtMessageTracker::new()));
        let dispatcher = Rc::new(RefCell::new(DhtMessageDispatcher::new(
            our_id,
            tracker,
            Duration::from_secs(10),
        )));
        (
            DhtTaskQueue::new(routing.clone(), dispatcher.clone()),
            routing,
            dispatcher,
        )
    }

    fn drain(dispatcher: &Rc<RefCell<DhtMessageDispatcher>>, now: Instant) -> Vec<DhtMessage> {
        let mut conn = Capture::default();
        dispatcher.borrow_mut().send_messages(&mut conn, now);
        conn.0
            .iter()
            .map(|(d, _)| DhtMessage::parse(d, now).unwrap())
            .collect()
    }

    #[test]
    fn test_bootstrap_queries_entry_points() {
        let now = Instant::now();
        let (mut q, _, dispatcher) = queue(now);
        q.add_task(DhtTask::Bootstrap(BootstrapTask::new(vec![
            "127.0.0.1:6881".to_string(),
            "127.0.0.2:6881".to_string(),
        ])));
        q.execute_tasks(now);

        let sent = drain(&dispatcher, now);
        assert_eq!(sent.len(), 2);
        for msg in &sent {
            assert!(matches!(
                msg.body,
                DhtMessageBody::Query(DhtQuery::FindNode { target }) if target == NodeId([0x10; 20])
            ));
        }

        // Later rounds wait for the interval, then the task ends
        q.execute_tasks(now + Duration::from_secs(1));
        assert!(drain(&dispatcher, now).is_empty());
        let mut t = now;
        for _ in 0..BOOTSTRAP_ROUNDS {
            t += BOOTSTRAP_ROUND_INTERVAL;
            q.execute_tasks(t);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_bootstrap_without_entry_points_ends() {
        let now = Instant::now();
        let (mut q, _, _) = queue(now);
        q.add_task(DhtTask::Bootstrap(BootstrapTask::new(Vec::new())));
        q.execute_tasks(now);
        assert!(q.is_empty());
    }

    #[test]
    fn test_refresh_targets_stale_bucket() {
        let now = Instant::now();
        let (mut q, routing, dispatcher) = queue(now);
        let interval = Duration::from_secs(900);
        let id = routing.borrow().our_id().random_in_bucket(4);
        let later = now + interval;
        routing
            .borrow_mut()
            .add_node(DhtNode::new(id, "10.0.0.4:6881".parse().unwrap(), now), now);
        // Keep the node good at refresh time
        routing.borrow_mut().mark_seen(&id, later);

        q.add_task(DhtTask::BucketRefresh(BucketRefreshTask::new(interval, now)));
        q.execute_tasks(later);

        let sent = drain(&dispatcher, later);
        assert_eq!(sent.len(), 1);
        let DhtMessageBody::Query(DhtQuery::FindNode { target }) = sent[0].body else {
            panic!("expected find_node");
        };
        assert_eq!(routing.borrow().our_id().bucket_index(&target), 4);
        assert_eq!(q.len(), 1);
    }
}
