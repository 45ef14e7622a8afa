//! Peer Exchange (BEP 11), extension name "ut_pex"
//!
//! Payload is a bencoded dictionary:
//! - added: compact IPv4 peers (6 bytes each: 4 IP + 2 port)
//! - added.f: one flag byte per added peer
//! - dropped: compact IPv4 peers that disconnected
//! - added6 / dropped6: compact IPv6 peers (18 bytes each)

use std::cell::RefCell;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::rc::Rc;

use tracing::debug;

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::torrent::bencode::BencodeValue;
use crate::torrent::peer::PeerStorage;

/// Extension name for PEX in the extension handshake
pub const PEX_EXTENSION_NAME: &str = "ut_pex";

/// Peers taken from one message at most
const MAX_FRESH_PEERS: usize = 50;

/// PEX flag bits for the added.f field
pub mod flags {
    /// Peer prefers encrypted connections
    pub const PREFERS_ENCRYPTION: u8 = 0x01;
    /// Peer is a seeder
    pub const IS_SEEDER: u8 = 0x02;
}

/// A ut_pex message
#[derive(Debug, Clone, Default)]
pub struct UtPexExtensionMessage {
    extension_message_id: u8,
    pub added: Vec<SocketAddr>,
    pub added_flags: Vec<u8>,
    pub dropped: Vec<SocketAddr>,
    peer_storage: Option<Rc<RefCell<PeerStorage>>>,
}

impl UtPexExtensionMessage {
    pub fn new(extension_message_id: u8) -> Self {
        Self {
            extension_message_id,
            ..Default::default()
        }
    }

    /// Decode an extended message: id byte followed by the dictionary
    pub fn create(data: &[u8]) -> Result<Self> {
        let Some((&id, payload)) = data.split_first() else {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PexError,
                "Too small payload size for ut_pex",
            ));
        };
        let value = BencodeValue::decode(payload)?;
        if !value.is_dict() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PexError,
                "PEX message must be a dict",
            ));
        }

        let compact = |key: &str| value.get(key).and_then(|v| v.as_bytes());
        let mut added = compact("added").map(parse_compact_peers_v4).unwrap_or_default();
        added.extend(compact("added6").map(parse_compact_peers_v6).unwrap_or_default());
        let mut dropped = compact("dropped").map(parse_compact_peers_v4).unwrap_or_default();
        dropped.extend(compact("dropped6").map(parse_compact_peers_v6).unwrap_or_default());

        Ok(Self {
            extension_message_id: id,
            added,
            added_flags: compact("added.f").map(<[u8]>::to_vec).unwrap_or_default(),
            dropped,
            peer_storage: None,
        })
    }

    pub fn extension_message_id(&self) -> u8 {
        self.extension_message_id
    }

    pub fn set_peer_storage(&mut self, storage: Rc<RefCell<PeerStorage>>) {
        self.peer_storage = Some(storage);
    }

    /// Bencoded payload, without the leading id byte
    pub fn payload(&self) -> Vec<u8> {
        let (v4_added, v6_added): (Vec<_>, Vec<_>) =
            self.added.iter().partition(|a| a.is_ipv4());
        let (v4_dropped, v6_dropped): (Vec<_>, Vec<_>) =
            self.dropped.iter().partition(|a| a.is_ipv4());

        let mut dict = BencodeValue::new_dict();
        dict.insert("added", encode_compact_peers(&v4_added));
        dict.insert("added.f", self.added_flags.clone());
        dict.insert("dropped", encode_compact_peers(&v4_dropped));
        if !v6_added.is_empty() {
            dict.insert("added6", encode_compact_peers(&v6_added));
        }
        if !v6_dropped.is_empty() {
            dict.insert("dropped6", encode_compact_peers(&v6_dropped));
        }
        dict.encode()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    pub(super) fn do_receive_action(&mut self) -> Result<()> {
        let Some(storage) = &self.peer_storage else {
            return Ok(());
        };
        let fresh = self.added.iter().copied().take(MAX_FRESH_PEERS);
        let added = storage.borrow_mut().add_peers(fresh);
        debug!(
            "ut_pex: {} added, {} dropped, {} new",
            self.added.len(),
            self.dropped.len(),
            added
        );
        Ok(())
    }
}

fn parse_compact_peers_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

fn parse_compact_peers_v6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .collect()
}

/// Compact form of `peers`; all must share one address family
pub(crate) fn encode_compact_peers(peers: &[&SocketAddr]) -> Vec<u8> {
    let mut data = Vec::with_capacity(peers.len() * 18);
    for peer in peers {
        match peer {
            SocketAddr::V4(addr) => data.extend_from_slice(&addr.ip().octets()),
            SocketAddr::V6(addr) => data.extend_from_slice(&addr.ip().octets()),
        }
        data.extend_from_slice(&peer.port().to_be_bytes());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, a), port))
    }

    #[test]
    fn test_parse_compact_peers_v4() {
        let data = [
            127, 0, 0, 1, 0x1a, 0xe1, // 127.0.0.1:6881
            192, 168, 1, 1, 0xc8, 0xd5, // 192.168.1.1:51413
        ];
        let peers = parse_compact_peers_v4(&data);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "192.168.1.1:51413".parse().unwrap());
    }

    #[test]
    fn test_create_from_wire() {
        let mut msg = UtPexExtensionMessage::new(4);
        msg.added = vec![v4(1, 6881), v4(2, 6882), "[::1]:7000".parse().unwrap()];
        msg.dropped = vec![v4(3, 6883)];
        let mut data = vec![4u8];
        data.extend_from_slice(&msg.payload());

        let decoded = UtPexExtensionMessage::create(&data).unwrap();
        assert_eq!(decoded.extension_message_id(), 4);
        assert_eq!(decoded.added.len(), 3);
        assert!(decoded.added.contains(&"[::1]:7000".parse().unwrap()));
        assert_eq!(decoded.dropped, vec![v4(3, 6883)]);
    }

    #[test]
    fn test_receive_action_feeds_peer_storage() {
        let storage = Rc::new(RefCell::new(PeerStorage::new()));
        let mut msg = UtPexExtensionMessage::new(1);
        msg.added = (1..=60).map(|i| v4(i, 6881)).collect();
        msg.set_peer_storage(Rc::clone(&storage));
        msg.do_receive_action().unwrap();
        assert_eq!(storage.borrow().num_unused(), MAX_FRESH_PEERS);
    }

    #[test]
    fn test_rejects_non_dict() {
        assert!(UtPexExtensionMessage::create(b"\x01le").is_err());
    }
}
