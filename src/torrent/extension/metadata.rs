//! Metadata exchange (BEP 9), extension name "ut_metadata"
//!
//! Lets a magnet download fetch the info dictionary from peers in
//! 16 KiB pieces. The bencoded header is followed directly by the
//! piece bytes for data messages.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use tracing::{debug, info};

use super::{extension_error, BtMessageDispatcher, BtMessageFactory};
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::group::context::DownloadContextHandle;
use crate::group::piece_storage::PieceStorageHandle;
use crate::torrent::bencode::BencodeValue;
use crate::torrent::peer::PeerHandle;

/// Extension name for metadata exchange in the extension handshake
pub const METADATA_EXTENSION_NAME: &str = "ut_metadata";

/// Metadata piece size (16 KiB per BEP 9)
pub const METADATA_PIECE_SIZE: usize = 16384;

/// ut_metadata message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

fn header(msg_type: MetadataMessageType, piece: usize) -> BencodeValue {
    BencodeValue::new_dict()
        .with("msg_type", msg_type as u64)
        .with("piece", piece)
}

/// Outstanding metadata piece requests
#[derive(Debug, Clone)]
pub struct UtMetadataRequestTracker {
    entries: Vec<(usize, Instant)>,
}

impl Default for UtMetadataRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UtMetadataRequestTracker {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, index: usize, now: Instant) {
        if !self.tracks(index) {
            self.entries.push((index, now));
        }
    }

    pub fn tracks(&self, index: usize) -> bool {
        self.entries.iter().any(|&(i, _)| i == index)
    }

    pub fn remove(&mut self, index: usize) {
        self.entries.retain(|&(i, _)| i != index);
    }

    /// Drop requests older than `timeout`, returning their indexes
    pub fn remove_timeout_entry(&mut self, now: Instant, timeout: Duration) -> Vec<usize> {
        let mut expired = Vec::new();
        self.entries.retain(|&(index, at)| {
            let live = now.saturating_duration_since(at) < timeout;
            if !live {
                expired.push(index);
            }
            live
        });
        expired
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn all_indexes(&self) -> Vec<usize> {
        self.entries.iter().map(|&(i, _)| i).collect()
    }
}

/// msg_type 0: peer asks us for a metadata piece
#[derive(Debug, Clone)]
pub struct UtMetadataRequestExtensionMessage {
    pub index: usize,
    download_context: Option<DownloadContextHandle>,
    peer: Option<PeerHandle>,
    dispatcher: Option<Rc<RefCell<BtMessageDispatcher>>>,
    message_factory: Option<Rc<BtMessageFactory>>,
}

impl UtMetadataRequestExtensionMessage {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            download_context: None,
            peer: None,
            dispatcher: None,
            message_factory: None,
        }
    }

    pub fn set_download_context(&mut self, ctx: DownloadContextHandle) {
        self.download_context = Some(ctx);
    }

    pub fn set_peer(&mut self, peer: PeerHandle) {
        self.peer = Some(peer);
    }

    pub fn set_dispatcher(&mut self, dispatcher: Rc<RefCell<BtMessageDispatcher>>) {
        self.dispatcher = Some(dispatcher);
    }

    pub fn set_message_factory(&mut self, factory: Rc<BtMessageFactory>) {
        self.message_factory = Some(factory);
    }

    pub fn payload(&self) -> Vec<u8> {
        header(MetadataMessageType::Request, self.index).encode()
    }

    pub(super) fn do_receive_action(&mut self) -> Result<()> {
        let (Some(ctx), Some(peer), Some(dispatcher), Some(factory)) = (
            &self.download_context,
            &self.peer,
            &self.dispatcher,
            &self.message_factory,
        ) else {
            return Err(EngineError::Internal(
                "ut_metadata request is not wired to a connection".to_string(),
            ));
        };
        let Some(id) = peer.borrow().extension_message_id(METADATA_EXTENSION_NAME) else {
            return Err(extension_error("Peer does not accept ut_metadata messages"));
        };

        let ctx = ctx.borrow();
        let metadata = ctx.torrent().and_then(|t| t.metadata.as_deref());
        let payload = match metadata {
            None => {
                debug!("No metadata yet, rejecting piece {}", self.index);
                UtMetadataRejectExtensionMessage::new(self.index).payload()
            }
            Some(metadata) => {
                let start = self.index * METADATA_PIECE_SIZE;
                if start >= metadata.len() {
                    return Err(EngineError::protocol(
                        ProtocolErrorKind::MetadataError,
                        format!("Metadata piece index is too big. piece={}", self.index),
                    ));
                }
                let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
                UtMetadataDataExtensionMessage::new(
                    self.index,
                    metadata.len(),
                    metadata[start..end].to_vec(),
                )
                .payload()
            }
        };
        dispatcher
            .borrow_mut()
            .add_message(factory.create_extended_message(id, payload));
        Ok(())
    }
}

/// msg_type 1: a metadata piece
#[derive(Debug, Clone)]
pub struct UtMetadataDataExtensionMessage {
    pub index: usize,
    pub total_size: usize,
    pub data: Vec<u8>,
    tracker: Option<Rc<RefCell<UtMetadataRequestTracker>>>,
    piece_storage: Option<PieceStorageHandle>,
    download_context: Option<DownloadContextHandle>,
}

impl UtMetadataDataExtensionMessage {
    pub fn new(index: usize, total_size: usize, data: Vec<u8>) -> Self {
        Self {
            index,
            total_size,
            data,
            tracker: None,
            piece_storage: None,
            download_context: None,
        }
    }

    pub fn set_tracker(&mut self, tracker: Rc<RefCell<UtMetadataRequestTracker>>) {
        self.tracker = Some(tracker);
    }

    pub fn set_piece_storage(&mut self, storage: Option<PieceStorageHandle>) {
        self.piece_storage = storage;
    }

    pub fn set_download_context(&mut self, ctx: DownloadContextHandle) {
        self.download_context = Some(ctx);
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut buf = header(MetadataMessageType::Data, self.index)
            .with("total_size", self.total_size)
            .encode();
        buf.extend_from_slice(&self.data);
        buf
    }

    pub(super) fn do_receive_action(&mut self) -> Result<()> {
        let Some(tracker) = &self.tracker else {
            return Ok(());
        };
        if !tracker.borrow().tracks(self.index) {
            debug!("ut_metadata index={} is not tracked", self.index);
            return Ok(());
        }
        let Some(storage) = &self.piece_storage else {
            debug!("ut_metadata index={} arrived without storage", self.index);
            return Ok(());
        };
        if self.data.len() > METADATA_PIECE_SIZE {
            return Err(EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                format!("Metadata piece {} is too large: {} bytes", self.index, self.data.len()),
            ));
        }

        let mut storage = storage.borrow_mut();
        storage.write_data(&self.data, (self.index * METADATA_PIECE_SIZE) as u64)?;
        storage.complete_piece(self.index);
        tracker.borrow_mut().remove(self.index);

        if !storage.download_finished() {
            return Ok(());
        }
        let metadata = storage.read_all()?;
        let Some(ctx) = &self.download_context else {
            return Ok(());
        };
        let mut ctx = ctx.borrow_mut();
        let Some(attrs) = ctx.torrent_mut() else {
            return Ok(());
        };
        let digest: [u8; 20] = Sha1::digest(&metadata).into();
        if digest == attrs.info_hash {
            info!("Got ut_metadata ({} bytes)", metadata.len());
            attrs.metadata = Some(metadata);
            Ok(())
        } else {
            storage.reset_all();
            Err(EngineError::protocol(
                ProtocolErrorKind::MetadataError,
                "Got wrong ut_metadata",
            ))
        }
    }
}

/// msg_type 2: peer refuses to serve a piece
#[derive(Debug, Clone, Copy)]
pub struct UtMetadataRejectExtensionMessage {
    pub index: usize,
}

impl UtMetadataRejectExtensionMessage {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    pub fn payload(&self) -> Vec<u8> {
        header(MetadataMessageType::Reject, self.index).encode()
    }

    pub(super) fn do_receive_action(&mut self) -> Result<()> {
        Err(extension_error("ut_metadata request was rejected"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::context::{DownloadContext, TorrentAttributes};
    use crate::group::piece_storage::{MemoryDiskWriter, PieceStorage};

    fn metadata_setup(metadata: &[u8]) -> (DownloadContextHandle, PieceStorageHandle) {
        let info_hash: [u8; 20] = Sha1::digest(metadata).into();
        let mut ctx = DownloadContext::for_metadata(info_hash, None);
        ctx.set_total_length(metadata.len() as u64);
        let storage = PieceStorage::new(
            Some(metadata.len() as u64),
            METADATA_PIECE_SIZE as u64,
            Box::new(MemoryDiskWriter::new()),
        );
        (ctx.into_handle(), Rc::new(RefCell::new(storage)))
    }

    fn data_message(
        index: usize,
        metadata: &[u8],
        tracker: &Rc<RefCell<UtMetadataRequestTracker>>,
        ctx: &DownloadContextHandle,
        storage: &PieceStorageHandle,
    ) -> UtMetadataDataExtensionMessage {
        let start = index * METADATA_PIECE_SIZE;
        let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
        let mut msg =
            UtMetadataDataExtensionMessage::new(index, metadata.len(), metadata[start..end].to_vec());
        msg.set_tracker(Rc::clone(tracker));
        msg.set_download_context(Rc::clone(ctx));
        msg.set_piece_storage(Some(Rc::clone(storage)));
        msg
    }

    #[test]
    fn test_tracker_timeout() {
        let start = Instant::now();
        let mut tracker = UtMetadataRequestTracker::new();
        tracker.add(0, start);
        tracker.add(1, start + Duration::from_secs(5));
        tracker.add(1, start + Duration::from_secs(6));
        assert_eq!(tracker.count(), 2);

        let expired =
            tracker.remove_timeout_entry(start + Duration::from_secs(10), Duration::from_secs(10));
        assert_eq!(expired, vec![0]);
        assert!(tracker.tracks(1));
        assert!(!tracker.tracks(0));
    }

    #[test]
    fn test_data_completes_metadata() {
        let metadata: Vec<u8> = (0..METADATA_PIECE_SIZE + 100).map(|i| i as u8).collect();
        let (ctx, storage) = metadata_setup(&metadata);
        let tracker = Rc::new(RefCell::new(UtMetadataRequestTracker::new()));
        let now = Instant::now();
        tracker.borrow_mut().add(0, now);
        tracker.borrow_mut().add(1, now);

        data_message(0, &metadata, &tracker, &ctx, &storage)
            .do_receive_action()
            .unwrap();
        assert!(ctx.borrow().torrent().unwrap().metadata.is_none());
        data_message(1, &metadata, &tracker, &ctx, &storage)
            .do_receive_action()
            .unwrap();

        assert_eq!(tracker.borrow().count(), 0);
        assert_eq!(
            ctx.borrow().torrent().unwrap().metadata.as_deref(),
            Some(metadata.as_slice())
        );
    }

    #[test]
    fn test_untracked_piece_ignored() {
        let metadata = b"d4:name4:teste".to_vec();
        let (ctx, storage) = metadata_setup(&metadata);
        let tracker = Rc::new(RefCell::new(UtMetadataRequestTracker::new()));
        data_message(0, &metadata, &tracker, &ctx, &storage)
            .do_receive_action()
            .unwrap();
        assert!(!storage.borrow().has_piece(0));
    }

    #[test]
    fn test_wrong_metadata_resets_storage() {
        let metadata = b"d4:name4:teste".to_vec();
        let (ctx, storage) = metadata_setup(&metadata);
        ctx.borrow_mut().set_torrent(TorrentAttributes {
            info_hash: [7u8; 20],
            metadata_only: true,
            ..Default::default()
        });
        let tracker = Rc::new(RefCell::new(UtMetadataRequestTracker::new()));
        tracker.borrow_mut().add(0, Instant::now());

        let err = data_message(0, &metadata, &tracker, &ctx, &storage)
            .do_receive_action()
            .unwrap_err();
        assert!(err.to_string().contains("Got wrong ut_metadata"));
        assert!(!storage.borrow().has_piece(0));
    }

    #[test]
    fn test_reject_aborts() {
        let err = UtMetadataRejectExtensionMessage::new(3)
            .do_receive_action()
            .unwrap_err();
        assert!(err.to_string().contains("ut_metadata request was rejected"));
    }
}
