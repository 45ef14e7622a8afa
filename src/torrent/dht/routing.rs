use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::node::{DhtNode, NodeId};

/// Bucket size
pub const K: usize = 8;
const NUM_BUCKETS: usize = 160;

#[derive(Debug)]
struct Bucket {
    nodes: VecDeque<DhtNode>,
    replacement_cache: VecDeque<DhtNode>,
    last_changed: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            nodes: VecDeque::with_capacity(K),
            replacement_cache: VecDeque::with_capacity(K),
            last_changed: now,
        }
    }

    fn add(&mut self, node: DhtNode, now: Instant) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == node.id) {
            if let Some(mut existing) = self.nodes.remove(pos) {
                existing.addr = node.addr;
                existing.touch(now);
                self.nodes.push_back(existing);
            }
            self.last_changed = now;
            return true;
        }

        if self.nodes.len() < K {
            self.nodes.push_back(node);
            self.last_changed = now;
            return true;
        }

        if let Some(pos) = self.nodes.iter().position(DhtNode::is_bad) {
            self.nodes.remove(pos);
            self.nodes.push_back(node);
            self.last_changed = now;
            return true;
        }

        if self.replacement_cache.len() >= K {
            self.replacement_cache.pop_front();
        }
        self.replacement_cache.push_back(node);
        false
    }

    fn remove(&mut self, id: &NodeId) -> Option<DhtNode> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        let removed = self.nodes.remove(pos);
        if let Some(replacement) = self.replacement_cache.pop_back() {
            self.nodes.push_back(replacement);
        }
        removed
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut DhtNode> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }
}

/// k-bucket routing table
#[derive(Debug)]
pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId, now: Instant) -> Self {
        Self {
            our_id,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new(now)).collect(),
        }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    /// True if the node is in the table afterwards
    pub fn add_node(&mut self, node: DhtNode, now: Instant) -> bool {
        if node.id == self.our_id {
            return false;
        }
        let idx = self.our_id.bucket_index(&node.id);
        self.buckets[idx].add(node, now)
    }

    pub fn remove_node(&mut self, id: &NodeId) {
        let idx = self.our_id.bucket_index(id);
        self.buckets[idx].remove(id);
    }

    pub fn mark_failed(&mut self, id: &NodeId) {
        let idx = self.our_id.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        let bad = match bucket.get_mut(id) {
            Some(node) => {
                node.fail();
                node.is_bad()
            }
            None => false,
        };
        if bad {
            bucket.remove(id);
        }
    }

    pub fn mark_seen(&mut self, id: &NodeId, now: Instant) {
        let idx = self.our_id.bucket_index(id);
        if let Some(node) = self.buckets[idx].get_mut(id) {
            node.touch(now);
        }
    }

    /// Up to `count` good nodes ordered by distance to `target`
    pub fn find_closest(&self, target: &NodeId, count: usize, now: Instant) -> Vec<DhtNode> {
        let mut nodes: Vec<&DhtNode> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.is_good(now))
            .collect();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.into_iter().take(count).cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn all_nodes(&self) -> Vec<DhtNode> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter().cloned())
            .collect()
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<&DhtNode> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .find(|n| &n.addr == addr)
    }

    /// Non-empty buckets unchanged for `interval`
    pub fn stale_buckets(&self, now: Instant, interval: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.nodes.is_empty() && now.saturating_duration_since(b.last_changed) >= interval
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Restart the staleness clock of a bucket being refreshed
    pub fn touch_bucket(&mut self, idx: usize, now: Instant) {
        if let Some(bucket) = self.buckets.get_mut(idx) {
            bucket.last_changed = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_in_bucket(table: &RoutingTable, bucket: usize, port: u16, now: Instant) -> DhtNode {
        let id = table.our_id().random_in_bucket(bucket);
        DhtNode::new(id, SocketAddr::from(([10, 0, 0, 1], port)), now)
    }

    #[test]
    fn test_bucket_capacity() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::generate(), now);
        for port in 0..K as u16 {
            let node = node_in_bucket(&table, 0, port + 1, now);
            assert!(table.add_node(node, now));
        }
        let extra = node_in_bucket(&table, 0, 100, now);
        assert!(!table.add_node(extra, now));
        assert_eq!(table.node_count(), K);
    }

    #[test]
    fn test_failed_node_replaced_from_cache() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::generate(), now);
        let nodes: Vec<_> = (1..=K as u16)
            .map(|p| node_in_bucket(&table, 3, p, now))
            .collect();
        for n in &nodes {
            table.add_node(n.clone(), now);
        }
        let spare = node_in_bucket(&table, 3, 999, now);
        table.add_node(spare.clone(), now);

        for _ in 0..3 {
            table.mark_failed(&nodes[0].id);
        }
        assert_eq!(table.node_count(), K);
        assert!(table.find_by_addr(&spare.addr).is_some());
        assert!(table.find_by_addr(&nodes[0].addr).is_none());
    }

    #[test]
    fn test_find_closest_orders_by_distance() {
        let now = Instant::now();
        let ours = NodeId([0u8; 20]);
        let mut table = RoutingTable::new(ours, now);
        for (i, first) in [0x80u8, 0x40, 0x01].into_iter().enumerate() {
            let mut id = [0u8; 20];
            id[0] = first;
            let addr = SocketAddr::from(([10, 0, 0, 1], i as u16 + 1));
            table.add_node(DhtNode::new(NodeId(id), addr, now), now);
        }
        let closest = table.find_closest(&ours, 2, now);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id.0[0], 0x01);
        assert_eq!(closest[1].id.0[0], 0x40);
    }

    #[test]
    fn test_stale_buckets() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::generate(), now);
        let node = node_in_bucket(&table, 2, 1, now);
        table.add_node(node, now);
        let interval = Duration::from_secs(900);
        assert!(table.stale_buckets(now, interval).is_empty());
        assert_eq!(table.stale_buckets(now + interval, interval), vec![2]);
        table.touch_bucket(2, now + interval);
        assert!(table.stale_buckets(now + interval, interval).is_empty());
    }
}
