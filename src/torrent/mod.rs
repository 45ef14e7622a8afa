//! BitTorrent Module
//!
//! The parts of BitTorrent the engine drives directly:
//! - Bencode codec
//! - Extension protocol messages (BEP 10): handshake, ut_pex, ut_metadata
//! - DHT node (BEP 5) sharing its socket with the UDP tracker client
//! - UDP tracker client (BEP 15)
//! - Per-download BitTorrent state registry

pub mod bencode;
pub mod dht;
pub mod extension;
pub mod peer;
pub mod registry;
pub mod udp_tracker;

// Re-export commonly used types
pub use bencode::BencodeValue;
pub use dht::{DhtInteractionTask, NodeId};
pub use extension::{DefaultExtensionMessageFactory, ExtensionMessage, ExtensionRegistry};
pub use peer::{Peer, PeerHandle, PeerStorage};
pub use registry::{BtObject, BtRegistry};
pub use udp_tracker::{UdpTrackerClient, UdpTrackerError, UdpTrackerRequest};
