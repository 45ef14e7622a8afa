use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use rand::Rng as _;

use crate::error::{EngineError, ProtocolErrorKind, Result};

const MAX_FAILURES: u8 = 3;

/// A node that answered within this window counts as good
pub const NODE_GOOD_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Compact node info: 20-byte id, IPv4, port
pub const COMPACT_NODE_LEN: usize = 26;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id: [u8; 20] = bytes.try_into().map_err(|_| {
            EngineError::protocol(
                ProtocolErrorKind::Krpc,
                format!("invalid node id length: {}", bytes.len()),
            )
        })?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Index of the k-bucket `other` falls into (length of the common prefix)
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);

        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        159
    }

    /// Random id sharing exactly `bucket_idx` leading bits with `self`
    pub fn random_in_bucket(&self, bucket_idx: usize) -> NodeId {
        if bucket_idx >= 160 {
            return NodeId::generate();
        }
        let mut id = NodeId::generate().0;
        let byte_idx = bucket_idx / 8;
        let bit = 7 - (bucket_idx % 8);

        id[..byte_idx].copy_from_slice(&self.0[..byte_idx]);
        let prefix_mask: u8 = !((1u16 << (bit + 1)) - 1) as u8;
        let flip = 1u8 << bit;
        id[byte_idx] = (self.0[byte_idx] & prefix_mask)
            | (!self.0[byte_idx] & flip)
            | (id[byte_idx] & (flip - 1));
        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone)]
pub struct DhtNode {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub failures: u8,
}

impl DhtNode {
    pub fn new(id: NodeId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
            failures: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_good(&self, now: Instant) -> bool {
        self.failures == 0 && now.saturating_duration_since(self.last_seen) < NODE_GOOD_INTERVAL
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    pub fn from_compact(data: &[u8], now: Instant) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);

        Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port), now))
    }

    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..20].copy_from_slice(&self.id.0);

        match self.addr {
            SocketAddr::V4(v4) => {
                compact[20..24].copy_from_slice(&v4.ip().octets());
                compact[24..26].copy_from_slice(&v4.port().to_be_bytes());
                Some(compact)
            }
            SocketAddr::V6(_) => None,
        }
    }
}

/// Decode a "nodes" string; trailing partial entries are ignored
pub fn parse_compact_nodes(data: &[u8], now: Instant) -> Vec<DhtNode> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|c| DhtNode::from_compact(c, now))
        .collect()
}

pub fn encode_compact_nodes(nodes: &[DhtNode]) -> Vec<u8> {
    nodes
        .iter()
        .filter_map(DhtNode::to_compact)
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        let a = NodeId([0u8; 20]);
        let mut b = [0u8; 20];
        b[0] = 0x80;
        assert_eq!(a.bucket_index(&NodeId(b)), 0);
        b[0] = 0x01;
        assert_eq!(a.bucket_index(&NodeId(b)), 7);
        let mut c = [0u8; 20];
        c[19] = 1;
        assert_eq!(a.bucket_index(&NodeId(c)), 159);
    }

    #[test]
    fn test_node_id_display() {
        let mut raw = [0u8; 20];
        raw[0] = 0x0f;
        raw[19] = 0xa0;
        let shown = NodeId(raw).to_string();
        assert_eq!(shown.len(), 40);
        assert!(shown.starts_with("0f00"));
        assert!(shown.ends_with("00a0"));
    }

    #[test]
    fn test_random_in_bucket() {
        let ours = NodeId::generate();
        for idx in [0, 5, 8, 77, 159] {
            let id = ours.random_in_bucket(idx);
            assert_eq!(ours.bucket_index(&id), idx);
        }
    }

    #[test]
    fn test_compact_node() {
        let now = Instant::now();
        let node = DhtNode::new(NodeId([9u8; 20]), "10.1.2.3:6881".parse().unwrap(), now);
        let compact = node.to_compact().unwrap();
        let decoded = DhtNode::from_compact(&compact, now).unwrap();
        assert_eq!(decoded.id, node.id);
        assert_eq!(decoded.addr, node.addr);
        assert!(DhtNode::from_compact(&compact[..25], now).is_none());
    }

    #[test]
    fn test_node_goodness() {
        let now = Instant::now();
        let mut node = DhtNode::new(NodeId([1u8; 20]), "10.0.0.1:1".parse().unwrap(), now);
        assert!(node.is_good(now));
        assert!(!node.is_good(now + NODE_GOOD_INTERVAL));
        for _ in 0..MAX_FAILURES {
            node.fail();
        }
        assert!(node.is_bad());
        node.touch(now);
        assert!(!node.is_bad());
    }
}
