//! BitTorrent extension protocol (BEP 10)
//!
//! Extended messages travel as peer-wire message id 20. The first payload
//! byte selects the extension: 0 is the handshake, any other value is an
//! id we advertised in our own handshake. [`DefaultExtensionMessageFactory`]
//! turns raw payloads into [`ExtensionMessage`] values bound to the
//! connection they arrived on.

pub mod handshake;
pub mod metadata;
pub mod pex;

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use bytes::{BufMut, BytesMut};

pub use handshake::HandshakeExtensionMessage;
pub use metadata::{
    UtMetadataDataExtensionMessage, UtMetadataRejectExtensionMessage,
    UtMetadataRequestExtensionMessage, UtMetadataRequestTracker, METADATA_EXTENSION_NAME,
    METADATA_PIECE_SIZE,
};
pub use pex::{UtPexExtensionMessage, PEX_EXTENSION_NAME};

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::group::context::DownloadContextHandle;
use crate::group::man::RequestGroupMan;
use crate::torrent::bencode::BencodeValue;
use crate::torrent::peer::{PeerHandle, PeerStorage};

/// Peer-wire message id of extended messages
pub const EXTENDED_MESSAGE_ID: u8 = 20;

pub(crate) fn extension_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::ExtensionMessage, message)
}

/// Ids we advertise for the extensions we understand
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    ids: BTreeMap<String, u8>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// ut_pex=1, ut_metadata=2
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.set_extension_message_id(PEX_EXTENSION_NAME, 1);
        registry.set_extension_message_id(METADATA_EXTENSION_NAME, 2);
        registry
    }

    /// Assign `id` to `name`; 0 removes it
    pub fn set_extension_message_id(&mut self, name: &str, id: u8) {
        self.ids.retain(|_, v| *v != id);
        if id == 0 {
            self.ids.remove(name);
        } else {
            self.ids.insert(name.to_string(), id);
        }
    }

    pub fn get_extension_message_id(&self, name: &str) -> Option<u8> {
        self.ids.get(name).copied()
    }

    pub fn get_extension_name(&self, id: u8) -> Option<&str> {
        self.ids
            .iter()
            .find(|(_, &v)| v == id)
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.ids.iter().map(|(name, &id)| (name.as_str(), id))
    }
}

/// Outgoing peer-wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtMessage {
    Extended { extension_message_id: u8, payload: Vec<u8> },
}

impl BtMessage {
    /// Length-prefixed wire form
    pub fn encode(&self) -> Vec<u8> {
        match self {
            BtMessage::Extended {
                extension_message_id,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(6 + payload.len());
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(EXTENDED_MESSAGE_ID);
                buf.put_u8(*extension_message_id);
                buf.put_slice(payload);
                buf.to_vec()
            }
        }
    }
}

/// Builds outgoing peer-wire messages
#[derive(Debug, Clone, Copy, Default)]
pub struct BtMessageFactory;

impl BtMessageFactory {
    pub fn create_extended_message(&self, extension_message_id: u8, payload: Vec<u8>) -> BtMessage {
        BtMessage::Extended {
            extension_message_id,
            payload,
        }
    }
}

/// Outgoing queue of one peer connection
#[derive(Debug, Default)]
pub struct BtMessageDispatcher {
    queue: VecDeque<BtMessage>,
}

impl BtMessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, message: BtMessage) {
        self.queue.push_back(message);
    }

    pub fn take_messages(&mut self) -> Vec<BtMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A decoded extension message
#[derive(Debug, Clone)]
pub enum ExtensionMessage {
    Handshake(HandshakeExtensionMessage),
    Pex(UtPexExtensionMessage),
    MetadataRequest(UtMetadataRequestExtensionMessage),
    MetadataData(UtMetadataDataExtensionMessage),
    MetadataReject(UtMetadataRejectExtensionMessage),
}

impl ExtensionMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ExtensionMessage::Handshake(_) => "handshake",
            ExtensionMessage::Pex(_) => PEX_EXTENSION_NAME,
            ExtensionMessage::MetadataRequest(_)
            | ExtensionMessage::MetadataData(_)
            | ExtensionMessage::MetadataReject(_) => METADATA_EXTENSION_NAME,
        }
    }

    /// Apply the message to the connection and download it is bound to
    pub fn do_receive_action(&mut self, groups: &mut RequestGroupMan) -> Result<()> {
        match self {
            ExtensionMessage::Handshake(m) => m.do_receive_action(groups),
            ExtensionMessage::Pex(m) => m.do_receive_action(),
            ExtensionMessage::MetadataRequest(m) => m.do_receive_action(),
            ExtensionMessage::MetadataData(m) => m.do_receive_action(),
            ExtensionMessage::MetadataReject(m) => m.do_receive_action(),
        }
    }
}

/// Decodes extended payloads for one peer connection
#[derive(Debug, Clone)]
pub struct DefaultExtensionMessageFactory {
    peer: PeerHandle,
    download_context: DownloadContextHandle,
    registry: Rc<ExtensionRegistry>,
    peer_storage: Rc<RefCell<PeerStorage>>,
    tracker: Rc<RefCell<UtMetadataRequestTracker>>,
    dispatcher: Rc<RefCell<BtMessageDispatcher>>,
    message_factory: Rc<BtMessageFactory>,
}

impl DefaultExtensionMessageFactory {
    pub fn new(
        peer: PeerHandle,
        download_context: DownloadContextHandle,
        registry: Rc<ExtensionRegistry>,
        peer_storage: Rc<RefCell<PeerStorage>>,
    ) -> Self {
        Self {
            peer,
            download_context,
            registry,
            peer_storage,
            tracker: Rc::new(RefCell::new(UtMetadataRequestTracker::new())),
            dispatcher: Rc::new(RefCell::new(BtMessageDispatcher::new())),
            message_factory: Rc::new(BtMessageFactory),
        }
    }

    pub fn with_tracker(mut self, tracker: Rc<RefCell<UtMetadataRequestTracker>>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Rc<RefCell<BtMessageDispatcher>>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn tracker(&self) -> &Rc<RefCell<UtMetadataRequestTracker>> {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Rc<RefCell<BtMessageDispatcher>> {
        &self.dispatcher
    }

    /// Our handshake for this connection
    pub fn build_handshake(&self) -> HandshakeExtensionMessage {
        let mut handshake = HandshakeExtensionMessage::from_registry(&self.registry);
        handshake.metadata_size = self
            .download_context
            .borrow()
            .torrent()
            .and_then(|t| t.metadata.as_ref().map(Vec::len));
        handshake
    }

    /// Decode `data` (extension id byte plus payload)
    pub fn create_message(&self, data: &[u8]) -> Result<ExtensionMessage> {
        let Some(&id) = data.first() else {
            return Err(extension_error(
                "Too small payload size for extension message",
            ));
        };
        if id == 0 {
            let mut handshake = HandshakeExtensionMessage::create(data)?;
            handshake.set_peer(Rc::clone(&self.peer));
            handshake.set_download_context(Rc::clone(&self.download_context));
            return Ok(ExtensionMessage::Handshake(handshake));
        }

        let Some(name) = self.registry.get_extension_name(id) else {
            return Err(extension_error(format!(
                "No extension registered for extended message ID {}",
                id
            )));
        };
        match name {
            PEX_EXTENSION_NAME => {
                let mut pex = UtPexExtensionMessage::create(data).map_err(|e| match e {
                    EngineError::Protocol { message, .. } => extension_error(message),
                    other => other,
                })?;
                pex.set_peer_storage(Rc::clone(&self.peer_storage));
                Ok(ExtensionMessage::Pex(pex))
            }
            METADATA_EXTENSION_NAME => self.create_ut_metadata(data),
            _ => Err(extension_error(format!(
                "Unsupported extension message received. extensionMessageID={}, extensionName={}",
                id, name
            ))),
        }
    }

    fn create_ut_metadata(&self, data: &[u8]) -> Result<ExtensionMessage> {
        if data.len() <= 1 {
            return Err(extension_error("Too small payload size for ut_metadata"));
        }
        let (dict, consumed) = match BencodeValue::decode_prefix(&data[1..]) {
            Ok((value, consumed)) if value.is_dict() => (value, consumed),
            _ => return Err(extension_error("Bad ut_metadata: dictionary not found")),
        };
        let Some(msg_type) = dict.get("msg_type").and_then(|v| v.as_int()) else {
            return Err(extension_error("Bad ut_metadata: msg_type not found"));
        };
        let Some(piece) = dict.get("piece").and_then(|v| v.as_int()) else {
            return Err(extension_error("Bad ut_metadata: piece not found"));
        };
        let Ok(index) = usize::try_from(piece) else {
            return Err(extension_error(format!(
                "Bad ut_metadata: piece index out of range: {}",
                piece
            )));
        };

        match msg_type {
            0 => {
                let mut m = UtMetadataRequestExtensionMessage::new(index);
                m.set_download_context(Rc::clone(&self.download_context));
                m.set_peer(Rc::clone(&self.peer));
                m.set_dispatcher(Rc::clone(&self.dispatcher));
                m.set_message_factory(Rc::clone(&self.message_factory));
                Ok(ExtensionMessage::MetadataRequest(m))
            }
            1 => {
                let body = &data[1 + consumed..];
                if body.is_empty() {
                    return Err(extension_error("Bad ut_metadata data: data not found"));
                }
                let Some(total_size) = dict
                    .get("total_size")
                    .and_then(|v| v.as_uint())
                    .map(|s| s as usize)
                else {
                    return Err(extension_error(
                        "Bad ut_metadata data: total_size not found",
                    ));
                };
                let mut m = UtMetadataDataExtensionMessage::new(index, total_size, body.to_vec());
                m.set_tracker(Rc::clone(&self.tracker));
                m.set_download_context(Rc::clone(&self.download_context));
                m.set_piece_storage(self.download_context.borrow().owner_piece_storage());
                Ok(ExtensionMessage::MetadataData(m))
            }
            2 => Ok(ExtensionMessage::MetadataReject(
                UtMetadataRejectExtensionMessage::new(index),
            )),
            n => Err(extension_error(format!(
                "Bad ut_metadata: unknown msg_type={}",
                n
            ))),
        }
    }
}
