//! Extension handshake (BEP 10, extended message id 0)

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{extension_error, ExtensionRegistry};
use crate::error::Result;
use crate::group::context::DownloadContextHandle;
use crate::group::man::RequestGroupMan;
use crate::torrent::bencode::BencodeValue;
use crate::torrent::peer::PeerHandle;

/// Client string advertised in our handshake
pub const CLIENT_VERSION: &str = concat!("tandem-dl/", env!("CARGO_PKG_VERSION"));

/// Decoded extension handshake
#[derive(Debug, Clone, Default)]
pub struct HandshakeExtensionMessage {
    /// Extension name -> id the sender wants to receive it under
    pub extensions: BTreeMap<String, u8>,
    pub tcp_port: Option<u16>,
    pub client_version: Option<String>,
    pub metadata_size: Option<usize>,
    pub request_queue_size: Option<usize>,
    peer: Option<PeerHandle>,
    download_context: Option<DownloadContextHandle>,
}

impl HandshakeExtensionMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our own handshake, advertising every id in `registry`
    pub fn from_registry(registry: &ExtensionRegistry) -> Self {
        Self {
            extensions: registry
                .iter()
                .map(|(name, id)| (name.to_string(), id))
                .collect(),
            client_version: Some(CLIENT_VERSION.to_string()),
            ..Default::default()
        }
    }

    /// Decode an extended message whose first byte is 0
    pub fn create(data: &[u8]) -> Result<Self> {
        let Some((&id, payload)) = data.split_first() else {
            return Err(extension_error("Too small payload size for handshake"));
        };
        if id != 0 {
            return Err(extension_error(format!(
                "Bad handshake: extension message id={}",
                id
            )));
        }
        let value = BencodeValue::decode(payload)
            .map_err(|e| extension_error(format!("Bad handshake: {}", e)))?;
        if !value.is_dict() {
            return Err(extension_error("Bad handshake: dictionary not found"));
        }

        let mut extensions = BTreeMap::new();
        if let Some(m) = value.get("m").and_then(|v| v.as_dict()) {
            for (name, id) in m {
                let Some(id) = id.as_uint().filter(|&id| id <= u8::MAX as u64) else {
                    continue;
                };
                extensions.insert(String::from_utf8_lossy(name).into_owned(), id as u8);
            }
        }

        Ok(Self {
            extensions,
            tcp_port: value
                .get("p")
                .and_then(|v| v.as_uint())
                .and_then(|p| u16::try_from(p).ok())
                .filter(|&p| p != 0),
            client_version: value
                .get("v")
                .and_then(|v| v.as_string())
                .map(str::to_string),
            metadata_size: value
                .get("metadata_size")
                .and_then(|v| v.as_uint())
                .map(|s| s as usize),
            request_queue_size: value
                .get("reqq")
                .and_then(|v| v.as_uint())
                .map(|r| r as usize),
            peer: None,
            download_context: None,
        })
    }

    pub fn set_peer(&mut self, peer: PeerHandle) {
        self.peer = Some(peer);
    }

    pub fn set_download_context(&mut self, ctx: DownloadContextHandle) {
        self.download_context = Some(ctx);
    }

    pub fn extension_message_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }

    /// Bencoded payload, without the leading id byte
    pub fn payload(&self) -> Vec<u8> {
        let mut m = BencodeValue::new_dict();
        for (name, id) in &self.extensions {
            m.insert(name, *id as u64);
        }
        let mut dict = BencodeValue::new_dict().with("m", m);
        if let Some(port) = self.tcp_port {
            dict.insert("p", port as u64);
        }
        if let Some(v) = &self.client_version {
            dict.insert("v", v.as_str());
        }
        if let Some(size) = self.metadata_size {
            dict.insert("metadata_size", size);
        }
        if let Some(reqq) = self.request_queue_size {
            dict.insert("reqq", reqq);
        }
        dict.encode()
    }

    pub(super) fn do_receive_action(&mut self, groups: &mut RequestGroupMan) -> Result<()> {
        if let Some(peer) = &self.peer {
            let mut peer = peer.borrow_mut();
            if self.tcp_port.is_some() {
                peer.set_listen_port(self.tcp_port);
            }
            peer.set_client(self.client_version.clone());
            for (name, id) in &self.extensions {
                peer.set_extension(name, *id);
            }
        }

        let Some(ctx) = &self.download_context else {
            return Ok(());
        };
        let owner = {
            let mut ctx = ctx.borrow_mut();
            let Some(attrs) = ctx.torrent_mut() else {
                return Ok(());
            };
            if attrs.metadata.is_some() {
                return Ok(());
            }
            let size = match self.metadata_size {
                Some(size) if size > 0 => size,
                _ => {
                    return Err(extension_error(
                        "Peer didn't provide metadata_size. It seems that it doesn't have whole metadata.",
                    ))
                }
            };
            match attrs.metadata_size {
                Some(known) if known != size => {
                    return Err(extension_error(format!(
                        "Wrong metadata_size: known={}, advertised={}",
                        known, size
                    )));
                }
                Some(_) => return Ok(()),
                None => attrs.metadata_size = Some(size),
            }
            ctx.set_total_length(size as u64);
            info!("Metadata size is {} bytes", size);
            ctx.owner()
        };

        if let Some(group) = owner.and_then(|gid| groups.get_mut(gid)) {
            group.drop_piece_storage();
            group.init_piece_storage()?;
            debug!("[{}] Metadata piece storage sized", group.gid());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_handshake() {
        let payload = BencodeValue::new_dict()
            .with(
                "m",
                BencodeValue::new_dict()
                    .with("ut_metadata", 3u64)
                    .with("ut_pex", 1u64),
            )
            .with("metadata_size", 31_235u64)
            .with("p", 6881u64)
            .with("v", "Transmission 4.0")
            .encode();
        let mut data = vec![0u8];
        data.extend_from_slice(&payload);

        let hs = HandshakeExtensionMessage::create(&data).unwrap();
        assert_eq!(hs.extension_message_id("ut_metadata"), Some(3));
        assert_eq!(hs.metadata_size, Some(31_235));
        assert_eq!(hs.tcp_port, Some(6881));
        assert_eq!(hs.client_version.as_deref(), Some("Transmission 4.0"));
    }

    #[test]
    fn test_own_handshake_advertises_registry() {
        let registry = ExtensionRegistry::with_defaults();
        let hs = HandshakeExtensionMessage::from_registry(&registry);
        let mut data = vec![0u8];
        data.extend_from_slice(&hs.payload());
        let decoded = HandshakeExtensionMessage::create(&data).unwrap();
        assert_eq!(decoded.extensions, hs.extensions);
        assert_eq!(decoded.client_version.as_deref(), Some(CLIENT_VERSION));
    }

    #[test]
    fn test_non_dict_payload_rejected() {
        assert!(HandshakeExtensionMessage::create(b"\0i1e").is_err());
        assert!(HandshakeExtensionMessage::create(b"").is_err());
    }
}
