//! Peers and the per-download peer list

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;

use tracing::trace;

/// Shared handle to one remote peer
pub type PeerHandle = Rc<RefCell<Peer>>;

/// Upper bound on remembered but unconnected peers
const MAX_PEER_LIST_SIZE: usize = 1024;

/// What we know about a remote peer
#[derive(Debug, Clone)]
pub struct Peer {
    addr: SocketAddr,
    /// Extension name -> message id the peer wants us to use
    extensions: HashMap<String, u8>,
    client: Option<String>,
    listen_port: Option<u16>,
    /// Set when the peer's messages could not be trusted
    pub bad: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            extensions: HashMap::new(),
            client: None,
            listen_port: None,
            bad: false,
        }
    }

    pub fn into_handle(self) -> PeerHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Record the id the peer assigned to `name`; 0 disables it
    pub fn set_extension(&mut self, name: &str, id: u8) {
        if id == 0 {
            self.extensions.remove(name);
        } else {
            self.extensions.insert(name.to_string(), id);
        }
    }

    pub fn extension_message_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }

    pub fn is_extension_enabled(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn set_client(&mut self, client: Option<String>) {
        self.client = client;
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    pub fn set_listen_port(&mut self, port: Option<u16>) {
        self.listen_port = port;
    }
}

/// Candidate peers of one download
#[derive(Debug, Default)]
pub struct PeerStorage {
    unused: VecDeque<SocketAddr>,
    known: HashSet<SocketAddr>,
}

impl PeerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one peer; false if it was known, unusable or the list is full
    pub fn add_peer(&mut self, addr: SocketAddr) -> bool {
        if addr.port() == 0 || addr.ip().is_unspecified() {
            return false;
        }
        if self.unused.len() >= MAX_PEER_LIST_SIZE || !self.known.insert(addr) {
            return false;
        }
        self.unused.push_back(addr);
        true
    }

    /// Add peers, returning how many were new
    pub fn add_peers(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        let added = addrs.into_iter().filter(|&a| self.add_peer(a)).count();
        if added > 0 {
            trace!("{} new peer(s), {} waiting", added, self.unused.len());
        }
        added
    }

    /// Next peer to connect to
    pub fn checkout_peer(&mut self) -> Option<SocketAddr> {
        self.unused.pop_front()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.known.contains(addr)
    }

    pub fn num_unused(&self) -> usize {
        self.unused.len()
    }

    pub fn known_peers(&self) -> &HashSet<SocketAddr> {
        &self.known
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_peers_dedups() {
        let mut storage = PeerStorage::new();
        let added = storage.add_peers([
            addr("10.0.0.1:6881"),
            addr("10.0.0.1:6881"),
            addr("10.0.0.2:6881"),
            addr("0.0.0.0:6881"),
            addr("10.0.0.3:0"),
        ]);
        assert_eq!(added, 2);
        assert_eq!(storage.checkout_peer(), Some(addr("10.0.0.1:6881")));
        assert!(storage.contains(&addr("10.0.0.1:6881")));
        // A checked-out peer is still known
        assert!(!storage.add_peer(addr("10.0.0.1:6881")));
    }

    #[test]
    fn test_extension_ids() {
        let mut peer = Peer::new(addr("10.0.0.1:1"));
        peer.set_extension("ut_metadata", 3);
        assert_eq!(peer.extension_message_id("ut_metadata"), Some(3));
        peer.set_extension("ut_metadata", 0);
        assert!(!peer.is_extension_enabled("ut_metadata"));
    }
}
