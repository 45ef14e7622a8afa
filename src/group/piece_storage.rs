//! Piece Storage
//!
//! Tracks which pieces of a download are complete or currently allocated,
//! and forwards payload bytes to a [`DiskWriter`]. Actual persistence is the
//! writer's business; the engine ships an in-memory writer only.

use std::cell::RefCell;
use std::rc::Rc;

use bitvec::prelude::*;
use bytes::BytesMut;

use super::context::DownloadContext;
use crate::error::{EngineError, Result, StorageErrorKind};

/// Shared handle used by a group and the tasks it spawned
pub type PieceStorageHandle = Rc<RefCell<PieceStorage>>;

/// Byte sink/source behind a piece storage
pub trait DiskWriter {
    /// Write `data` at absolute `offset`
    fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()>;

    /// Read into `buf` from absolute `offset`, returning bytes read
    fn read_data(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Current size of the written data
    fn size(&self) -> u64;
}

/// Creates writers for a download
pub trait DiskWriterFactory {
    fn new_disk_writer(&self, ctx: &DownloadContext) -> Result<Box<dyn DiskWriter>>;
}

/// Growable in-memory writer
#[derive(Debug, Default)]
pub struct MemoryDiskWriter {
    buf: BytesMut,
}

impl MemoryDiskWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn data(&self) -> &[u8] {
        &self.buf
    }
}

impl DiskWriter for MemoryDiskWriter {
    fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| {
            EngineError::storage(StorageErrorKind::OutOfRange, "", "offset too large")
        })?;
        let end = start + data.len();
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_data(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let start = match usize::try_from(offset) {
            Ok(start) if start < self.buf.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(self.buf.len() - start);
        buf[..n].copy_from_slice(&self.buf[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.buf.len() as u64
    }
}

/// Factory producing [`MemoryDiskWriter`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryDiskWriterFactory;

impl DiskWriterFactory for MemoryDiskWriterFactory {
    fn new_disk_writer(&self, _ctx: &DownloadContext) -> Result<Box<dyn DiskWriter>> {
        Ok(Box::new(MemoryDiskWriter::new()))
    }
}

/// Completion and allocation state of one download's pieces
pub struct PieceStorage {
    piece_length: u64,
    /// `None` until the total size is learned (streams without a length,
    /// magnet downloads before the metadata size arrives)
    total_length: Option<u64>,
    completed: BitVec<u8, Msb0>,
    in_use: BitVec<u8, Msb0>,
    /// Bytes received while the length is unknown
    streamed: u64,
    writer: Box<dyn DiskWriter>,
}

impl std::fmt::Debug for PieceStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStorage")
            .field("piece_length", &self.piece_length)
            .field("total_length", &self.total_length)
            .field("completed", &self.completed.count_ones())
            .field("num_pieces", &self.completed.len())
            .finish()
    }
}

impl PieceStorage {
    /// Create storage for `total_length` bytes split into `piece_length` pieces
    pub fn new(total_length: Option<u64>, piece_length: u64, writer: Box<dyn DiskWriter>) -> Self {
        let piece_length = piece_length.max(1);
        let num_pieces = total_length
            .map(|len| len.div_ceil(piece_length) as usize)
            .unwrap_or(0);
        Self {
            piece_length,
            total_length,
            completed: bitvec![u8, Msb0; 0; num_pieces],
            in_use: bitvec![u8, Msb0; 0; num_pieces],
            streamed: 0,
            writer,
        }
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> Option<u64> {
        self.total_length
    }

    pub fn is_length_known(&self) -> bool {
        self.total_length.is_some()
    }

    pub fn num_pieces(&self) -> usize {
        self.completed.len()
    }

    /// Offset and length of piece `index`
    pub fn piece_range(&self, index: usize) -> (u64, u64) {
        let offset = index as u64 * self.piece_length;
        let total = self.total_length.unwrap_or(0);
        let len = self.piece_length.min(total.saturating_sub(offset));
        (offset, len)
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.completed.get(index).is_some_and(|b| *b)
    }

    pub fn complete_piece(&mut self, index: usize) {
        if index < self.completed.len() {
            self.completed.set(index, true);
            self.in_use.set(index, false);
        }
    }

    pub fn reset_piece(&mut self, index: usize) {
        if index < self.completed.len() {
            self.completed.set(index, false);
        }
    }

    /// Forget every completed piece
    pub fn reset_all(&mut self) {
        self.completed.fill(false);
        self.in_use.fill(false);
    }

    pub fn is_piece_used(&self, index: usize) -> bool {
        self.in_use.get(index).is_some_and(|b| *b)
    }

    pub fn set_piece_used(&mut self, index: usize, used: bool) {
        if index < self.in_use.len() {
            self.in_use.set(index, used);
        }
    }

    /// Lowest piece that is neither complete nor allocated
    pub fn missing_unused_piece(&self) -> Option<usize> {
        (0..self.completed.len()).find(|&i| !self.completed[i] && !self.in_use[i])
    }

    pub fn count_missing_unused_pieces(&self) -> usize {
        (0..self.completed.len())
            .filter(|&i| !self.completed[i] && !self.in_use[i])
            .count()
    }

    pub fn count_completed_pieces(&self) -> usize {
        self.completed.count_ones()
    }

    /// Bytes covered by completed pieces
    pub fn completed_length(&self) -> u64 {
        if self.total_length.is_none() {
            return self.streamed;
        }
        self.completed
            .iter_ones()
            .map(|i| self.piece_range(i).1)
            .sum()
    }

    /// Every byte of `[offset, offset + len)` lies in a completed piece
    pub fn range_finished(&self, offset: u64, len: u64) -> bool {
        if self.total_length.is_none() {
            return false;
        }
        if len == 0 {
            return true;
        }
        let first = (offset / self.piece_length) as usize;
        let last = ((offset + len - 1) / self.piece_length) as usize;
        (first..=last).all(|i| self.has_piece(i))
    }

    /// All pieces complete and the length known
    pub fn download_finished(&self) -> bool {
        self.total_length.is_some() && self.completed.all()
    }

    pub fn bitfield(&self) -> &BitSlice<u8, Msb0> {
        &self.completed
    }

    pub fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if let Some(total) = self.total_length {
            if offset + data.len() as u64 > total {
                return Err(EngineError::storage(
                    StorageErrorKind::OutOfRange,
                    "",
                    format!(
                        "write of {} bytes at {} exceeds length {}",
                        data.len(),
                        offset,
                        total
                    ),
                ));
            }
        } else {
            self.streamed = self.streamed.max(offset + data.len() as u64);
        }
        self.writer.write_data(data, offset)
    }

    pub fn read_data(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.writer.read_data(buf, offset)
    }

    /// Read the whole download back; meant for small in-memory payloads
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let len = self.total_length.unwrap_or(self.streamed);
        let mut out = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < out.len() {
            let n = self.writer.read_data(&mut out[filled..], filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Fix the length of an unknown-length stream once it hits EOF and
    /// mark everything received as complete
    pub fn finish_stream(&mut self, total: u64) {
        let num_pieces = total.div_ceil(self.piece_length) as usize;
        self.total_length = Some(total);
        self.completed = bitvec![u8, Msb0; 1; num_pieces];
        self.in_use = bitvec![u8, Msb0; 0; num_pieces];
        self.streamed = total;
    }
}
