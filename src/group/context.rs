//! Download context: file layout and torrent attributes of one download

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use super::piece_storage::{PieceStorage, PieceStorageHandle};
use crate::types::GroupId;

/// Shared handle to a download context
pub type DownloadContextHandle = Rc<RefCell<DownloadContext>>;

/// One file of a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    /// Offset of this file within the concatenated download
    pub offset: u64,
    /// Whether the user asked for this file
    pub requested: bool,
}

/// BitTorrent-specific attributes
#[derive(Debug, Clone, Default)]
pub struct TorrentAttributes {
    pub info_hash: [u8; 20],
    pub name: Option<String>,
    /// Raw info dictionary, once known
    pub metadata: Option<Vec<u8>>,
    /// Size of the info dictionary as advertised by peers
    pub metadata_size: Option<usize>,
    /// True for a magnet download fetching only the info dictionary
    pub metadata_only: bool,
}

/// File and piece layout of a download
#[derive(Debug)]
pub struct DownloadContext {
    file_entries: Vec<FileEntry>,
    piece_length: u64,
    length_known: bool,
    torrent: Option<TorrentAttributes>,
    owner: Option<GroupId>,
    owner_piece_storage: Weak<RefCell<PieceStorage>>,
}

impl DownloadContext {
    /// Context for several files laid out back to back
    pub fn new(piece_length: u64, files: Vec<(PathBuf, u64)>) -> Self {
        let mut offset = 0;
        let file_entries = files
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry {
                    path,
                    length,
                    offset,
                    requested: true,
                };
                offset += length;
                entry
            })
            .collect();
        Self {
            file_entries,
            piece_length,
            length_known: true,
            torrent: None,
            owner: None,
            owner_piece_storage: Weak::new(),
        }
    }

    /// Single-file context whose length is learned from the wire
    pub fn unknown_length(path: impl Into<PathBuf>, piece_length: u64) -> Self {
        let mut ctx = Self::new(piece_length, vec![(path.into(), 0)]);
        ctx.length_known = false;
        ctx
    }

    /// Magnet download: only the info dictionary, size not yet known
    pub fn for_metadata(info_hash: [u8; 20], name: Option<String>) -> Self {
        let label = name.clone().unwrap_or_else(|| hex::encode(info_hash));
        let mut ctx = Self::unknown_length(format!("[METADATA]{}", label), 16 * 1024);
        ctx.torrent = Some(TorrentAttributes {
            info_hash,
            name,
            metadata: None,
            metadata_size: None,
            metadata_only: true,
        });
        ctx
    }

    pub fn into_handle(self) -> DownloadContextHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn file_entries(&self) -> &[FileEntry] {
        &self.file_entries
    }

    pub fn file_entries_mut(&mut self) -> &mut [FileEntry] {
        &mut self.file_entries
    }

    pub fn first_file_path(&self) -> Option<&Path> {
        self.file_entries.first().map(|f| f.path.as_path())
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.file_entries.iter().map(|f| f.length).sum()
    }

    pub fn is_length_known(&self) -> bool {
        self.length_known
    }

    /// Set the length of a single-file download and mark it known
    pub fn set_total_length(&mut self, length: u64) {
        if let Some(first) = self.file_entries.first_mut() {
            first.length = length;
        }
        self.file_entries.truncate(1);
        self.length_known = true;
    }

    pub fn set_piece_length(&mut self, piece_length: u64) {
        self.piece_length = piece_length;
    }

    pub fn torrent(&self) -> Option<&TorrentAttributes> {
        self.torrent.as_ref()
    }

    pub fn torrent_mut(&mut self) -> Option<&mut TorrentAttributes> {
        self.torrent.as_mut()
    }

    pub fn set_torrent(&mut self, attrs: TorrentAttributes) {
        self.torrent = Some(attrs);
    }

    pub fn info_hash(&self) -> Option<&[u8; 20]> {
        self.torrent.as_ref().map(|t| &t.info_hash)
    }

    pub fn owner(&self) -> Option<GroupId> {
        self.owner
    }

    pub fn set_owner(&mut self, gid: GroupId) {
        self.owner = Some(gid);
    }

    /// Piece storage of the owning group, if it currently has one
    pub fn owner_piece_storage(&self) -> Option<PieceStorageHandle> {
        self.owner_piece_storage.upgrade()
    }

    pub(crate) fn publish_piece_storage(&mut self, storage: Option<&PieceStorageHandle>) {
        self.owner_piece_storage = storage.map(Rc::downgrade).unwrap_or_default();
    }
}
