//! Incoming KRPC handling
//!
//! Queries are answered through the dispatcher. Replies are matched against
//! the tracker and handed to the callback registered with the query.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use tracing::debug;

use super::dispatcher::DhtMessageDispatcher;
use super::message::{DhtMessage, DhtMessageBody, DhtQuery, DhtResponse, ERROR_PROTOCOL};
use super::node::{DhtNode, NodeId};
use super::routing::{RoutingTable, K};
use super::tracker::DhtMessageTracker;
use crate::error::Result;

/// Announce tokens stay valid for one rotation after they were handed out
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Lifetime of an announced peer
pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

const MAX_PEERS_PER_INFO_HASH: usize = 1000;
const MAX_VALUES_PER_REPLY: usize = 50;

#[derive(Debug)]
struct TokenTracker {
    secrets: [[u8; 20]; 2],
    last_rotated: Instant,
}

impl TokenTracker {
    fn new(now: Instant) -> Self {
        Self {
            secrets: [rand::random(), rand::random()],
            last_rotated: now,
        }
    }

    fn token_with(secret: &[u8; 20], addr: &SocketAddr) -> Vec<u8> {
        let mut hasher = Sha1::new();
        match addr.ip() {
            IpAddr::V4(ip) => hasher.update(ip.octets()),
            IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.update(addr.port().to_be_bytes());
        hasher.update(secret);
        hasher.finalize().to_vec()
    }

    fn generate(&self, addr: &SocketAddr) -> Vec<u8> {
        Self::token_with(&self.secrets[0], addr)
    }

    fn validate(&self, token: &[u8], addr: &SocketAddr) -> bool {
        self.secrets
            .iter()
            .any(|secret| Self::token_with(secret, addr) == token)
    }

    fn rotate_if_due(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_rotated) >= TOKEN_ROTATE_INTERVAL {
            self.secrets[1] = self.secrets[0];
            self.secrets[0] = rand::random();
            self.last_rotated = now;
        }
    }
}

/// Peers announced to us via announce_peer
#[derive(Debug, Default)]
pub struct PeerAnnounceStorage {
    entries: HashMap<[u8; 20], Vec<(SocketAddr, Instant)>>,
}

impl PeerAnnounceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, info_hash: [u8; 20], addr: SocketAddr, now: Instant) {
        let peers = self.entries.entry(info_hash).or_default();
        if let Some(entry) = peers.iter_mut().find(|(a, _)| *a == addr) {
            entry.1 = now;
            return;
        }
        if peers.len() >= MAX_PEERS_PER_INFO_HASH {
            peers.remove(0);
        }
        peers.push((addr, now));
    }

    pub fn get_peers(&self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.entries
            .get(info_hash)
            .map(|peers| {
                peers
                    .iter()
                    .rev()
                    .take(MAX_VALUES_PER_REPLY)
                    .map(|(a, _)| *a)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, info_hash: &[u8; 20]) -> bool {
        self.entries.contains_key(info_hash)
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        for peers in self.entries.values_mut() {
            peers.retain(|(_, at)| now.saturating_duration_since(*at) < PEER_ANNOUNCE_LIFETIME);
        }
        self.entries.retain(|_, peers| !peers.is_empty());
    }
}

pub struct DhtMessageReceiver {
    routing: Rc<RefCell<RoutingTable>>,
    tracker: Rc<RefCell<DhtMessageTracker>>,
    dispatcher: Rc<RefCell<DhtMessageDispatcher>>,
    tokens: TokenTracker,
    peer_announce_storage: PeerAnnounceStorage,
}

impl DhtMessageReceiver {
    pub fn new(
        routing: Rc<RefCell<RoutingTable>>,
        tracker: Rc<RefCell<DhtMessageTracker>>,
        dispatcher: Rc<RefCell<DhtMessageDispatcher>>,
        now: Instant,
    ) -> Self {
        Self {
            routing,
            tracker,
            dispatcher,
            tokens: TokenTracker::new(now),
            peer_announce_storage: PeerAnnounceStorage::new(),
        }
    }

    pub fn peer_announce_storage(&self) -> &PeerAnnounceStorage {
        &self.peer_announce_storage
    }

    /// Handle one datagram that decoded as a bencoded dictionary
    pub fn receive_message(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> Result<()> {
        let msg = DhtMessage::parse(data, now)?;

        match &msg.body {
            DhtMessageBody::Query(query) => {
                if let Some(id) = msg.sender_id {
                    self.routing
                        .borrow_mut()
                        .add_node(DhtNode::new(id, from, now), now);
                }
                let reply = self.answer(&msg, query, from, now);
                self.dispatcher.borrow_mut().add_message(reply, from);
            }
            DhtMessageBody::Response(response) => {
                let Some(mut entry) = self.tracker.borrow_mut().message_arrived(&msg, from) else {
                    debug!("Unsolicited DHT reply from {}", from);
                    return Ok(());
                };
                {
                    let mut routing = self.routing.borrow_mut();
                    if let Some(id) = msg.sender_id {
                        routing.add_node(DhtNode::new(id, from, now), now);
                    }
                    for node in &response.nodes {
                        routing.add_node(node.clone(), now);
                    }
                }
                entry.complete(Some(response));
            }
            DhtMessageBody::Error { code, message } => {
                debug!("DHT error {} from {}: {}", code, from, message);
                let entry = self.tracker.borrow_mut().message_arrived(&msg, from);
                if let Some(mut entry) = entry {
                    entry.complete(None);
                }
            }
        }
        Ok(())
    }

    fn answer(
        &mut self,
        msg: &DhtMessage,
        query: &DhtQuery,
        from: SocketAddr,
        now: Instant,
    ) -> DhtMessage {
        let tid = msg.transaction_id.clone();
        let our_id = *self.routing.borrow().our_id();

        let response = match query {
            DhtQuery::Ping => DhtResponse::default(),
            DhtQuery::FindNode { target } => DhtResponse {
                nodes: self.routing.borrow().find_closest(target, K, now),
                ..Default::default()
            },
            DhtQuery::GetPeers { info_hash } => {
                let peers = self.peer_announce_storage.get_peers(info_hash);
                let nodes = if peers.is_empty() {
                    self.routing
                        .borrow()
                        .find_closest(&NodeId(*info_hash), K, now)
                } else {
                    Vec::new()
                };
                DhtResponse {
                    nodes,
                    peers,
                    token: Some(self.tokens.generate(&from)),
                    ..Default::default()
                }
            }
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.tokens.validate(token, &from) {
                    debug!("Invalid announce token from {}", from);
                    return DhtMessage::error(tid, ERROR_PROTOCOL, "Invalid token");
                }
                let port = if *implied_port { from.port() } else { *port };
                self.peer_announce_storage
                    .add_peer(*info_hash, SocketAddr::new(from.ip(), port), now);
                DhtResponse::default()
            }
        };

        DhtMessage::response(tid, our_id, response)
    }

    /// Expire unanswered queries, rotate tokens and age announced peers
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired = self.tracker.borrow_mut().handle_timeout(now);
        for mut entry in expired {
            debug!("DHT {} to {} timed out", entry.method, entry.addr);
            {
                let mut routing = self.routing.borrow_mut();
                let id = entry
                    .node_id
                    .or_else(|| routing.find_by_addr(&entry.addr).map(|n| n.id));
                if let Some(id) = id {
                    routing.mark_failed(&id);
                }
            }
            entry.complete(None);
        }
        self.tokens.rotate_if_due(now);
        self.peer_announce_storage.handle_timeout(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::dht::connection::DhtConnection;
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

    struct Fixture {
        receiver: DhtMessageReceiver,
        routing: Rc<RefCell<RoutingTable>>,
        dispatcher: Rc<RefCell<DhtMessageDispatcher>>,
        now: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            let now = Instant::now();
            let our_id = NodeId([0x11; 20]);
            let routing = Rc::new(RefCell::new(RoutingTable::new(our_id, now)));
            let tracker = Rc::new(RefCell::new(DhtMessageTracker::new()));
            let dispatcher = Rc::new(RefCell::new(DhtMessageDispatcher::new(
                our_id,
                tracker.clone(),
                Duration::from_secs(10),
            )));
            let receiver =
                DhtMessageReceiver::new(routing.clone(), tracker, dispatcher.clone(), now);
            Self {
                receiver,
                routing,
                dispatcher,
                now,
            }
        }

        fn flush(&self) -> Vec<DhtMessage> {
            let mut conn = Capture::default();
            self.dispatcher.borrow_mut().send_messages(&mut conn, self.now);
            conn.0
                .iter()
                .map(|(data, _)| DhtMessage::parse(data, self.now).unwrap())
                .collect()
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.5:7000".parse().unwrap()
    }

    #[test]
    fn test_ping_is_answered_and_sender_added() {
        let mut fx = Fixture::new();
        let ping = DhtMessage::query(b"p1".to_vec(), NodeId([0x22; 20]), DhtQuery::Ping);
        fx.receiver
            .receive_message(&ping.encode(), peer(), fx.now)
            .unwrap();

        let replies = fx.flush();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].transaction_id, b"p1");
        assert_eq!(replies[0].sender_id, Some(NodeId([0x11; 20])));
        assert_eq!(fx.routing.borrow().node_count(), 1);
    }

    #[test]
    fn test_announce_requires_token_from_get_peers() {
        let mut fx = Fixture::new();
        let info_hash = [0x33; 20];
        let sender = NodeId([0x22; 20]);

        let bad = DhtMessage::query(
            b"a1".to_vec(),
            sender,
            DhtQuery::AnnouncePeer {
                info_hash,
                port: 6881,
                token: b"bogus".to_vec(),
                implied_port: false,
            },
        );
        fx.receiver.receive_message(&bad.encode(), peer(), fx.now).unwrap();
        let replies = fx.flush();
        assert!(matches!(
            replies[0].body,
            DhtMessageBody::Error { code: ERROR_PROTOCOL, .. }
        ));

        let get_peers = DhtMessage::query(b"g1".to_vec(), sender, DhtQuery::GetPeers { info_hash });
        fx.receiver
            .receive_message(&get_peers.encode(), peer(), fx.now)
            .unwrap();
        let replies = fx.flush();
        let DhtMessageBody::Response(resp) = &replies[0].body else {
            panic!("expected a response");
        };
        let token = resp.token.clone().unwrap();

        let good = DhtMessage::query(
            b"a2".to_vec(),
            sender,
            DhtQuery::AnnouncePeer {
                info_hash,
                port: 6881,
                token,
                implied_port: false,
            },
        );
        fx.receiver.receive_message(&good.encode(), peer(), fx.now).unwrap();
        assert_eq!(
            fx.receiver.peer_announce_storage().get_peers(&info_hash),
            vec!["10.0.0.5:6881".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn test_reply_runs_callback_and_timeout_marks_failure() {
        let mut fx = Fixture::new();
        let remote = NodeId([0x44; 20]);
        let got = Rc::new(RefCell::new(None));
        let slot = got.clone();
        let tid = fx.dispatcher.borrow_mut().add_query(
            DhtQuery::Ping,
            peer(),
            Some(remote),
            Some(Box::new(move |resp: Option<&DhtResponse>| {
                *slot.borrow_mut() = Some(resp.is_some())
            })),
        );
        fx.flush();

        let reply = DhtMessage::response(tid, remote, DhtResponse::default());
        fx.receiver.receive_message(&reply.encode(), peer(), fx.now).unwrap();
        assert_eq!(*got.borrow(), Some(true));
        assert_eq!(fx.routing.borrow().node_count(), 1);

        // An unanswered query fails the node after the timeout
        fx.dispatcher
            .borrow_mut()
            .add_query(DhtQuery::Ping, peer(), Some(remote), None);
        fx.flush();
        fx.receiver.handle_timeout(fx.now + Duration::from_secs(11));
        let routing = fx.routing.borrow();
        assert_eq!(routing.find_by_addr(&peer()).map(|n| n.failures), Some(1));
    }

    #[test]
    fn test_peer_storage_expires() {
        let now = Instant::now();
        let mut storage = PeerAnnounceStorage::new();
        storage.add_peer([1; 20], peer(), now);
        assert!(storage.contains(&[1; 20]));
        storage.handle_timeout(now + PEER_ANNOUNCE_LIFETIME);
        assert!(!storage.contains(&[1; 20]));
    }
}
