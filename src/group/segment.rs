//! Segment allocation
//!
//! A segment is the byte range of one piece handed to one transfer task.
//! `SegmentMan` makes sure no piece is given to two tasks at once.

use std::collections::HashMap;

use super::piece_storage::PieceStorageHandle;
use crate::types::Cuid;

/// A piece-sized range assigned to one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Piece index
    pub index: usize,
    /// Absolute offset of the first byte
    pub position: u64,
    /// Expected length, `None` for an open-ended stream
    pub length: Option<u64>,
    /// Bytes written so far
    pub written: u64,
}

impl Segment {
    /// Offset where the next byte goes
    pub fn write_position(&self) -> u64 {
        self.position + self.written
    }

    /// Bytes still expected, `None` when open-ended
    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|len| len.saturating_sub(self.written))
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == Some(0)
    }

    pub fn is_open_ended(&self) -> bool {
        self.length.is_none()
    }
}

/// Hands out segments of a piece storage to tasks
#[derive(Debug)]
pub struct SegmentMan {
    storage: PieceStorageHandle,
    /// Piece index held by each task
    used: HashMap<Cuid, usize>,
}

impl SegmentMan {
    pub fn new(storage: PieceStorageHandle) -> Self {
        Self {
            storage,
            used: HashMap::new(),
        }
    }

    /// Segment for `cuid`: the one it already holds, or a fresh one
    pub fn get_segment(&mut self, cuid: Cuid) -> Option<Segment> {
        let mut storage = self.storage.borrow_mut();

        if !storage.is_length_known() {
            // Only one task may stream an unknown-length download
            if !self.used.is_empty() && !self.used.contains_key(&cuid) {
                return None;
            }
            self.used.insert(cuid, 0);
            return Some(Segment {
                index: 0,
                position: 0,
                length: None,
                written: 0,
            });
        }

        let index = match self.used.get(&cuid) {
            Some(&index) => index,
            None => {
                let index = storage.missing_unused_piece()?;
                storage.set_piece_used(index, true);
                self.used.insert(cuid, index);
                index
            }
        };
        let (position, length) = storage.piece_range(index);
        Some(Segment {
            index,
            position,
            length: Some(length),
            written: 0,
        })
    }

    pub fn has_segment(&self, cuid: Cuid) -> bool {
        self.used.contains_key(&cuid)
    }

    /// Mark the task's piece complete and release it
    pub fn complete_segment(&mut self, cuid: Cuid, segment: &Segment) {
        if self.used.remove(&cuid).is_some() && !segment.is_open_ended() {
            self.storage.borrow_mut().complete_piece(segment.index);
        }
    }

    /// Give the task's piece back unfinished
    pub fn cancel_segment(&mut self, cuid: Cuid) {
        if let Some(index) = self.used.remove(&cuid) {
            self.storage.borrow_mut().set_piece_used(index, false);
        }
    }

    /// Segments that could still be handed out
    pub fn count_free_segments(&self) -> usize {
        let storage = self.storage.borrow();
        if storage.is_length_known() {
            storage.count_missing_unused_pieces()
        } else if self.used.is_empty() {
            1
        } else {
            0
        }
    }

    pub fn count_used_segments(&self) -> usize {
        self.used.len()
    }

    pub fn piece_storage(&self) -> &PieceStorageHandle {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::group::piece_storage::{MemoryDiskWriter, PieceStorage};

    fn man(total: Option<u64>, piece: u64) -> SegmentMan {
        let ps = PieceStorage::new(total, piece, Box::new(MemoryDiskWriter::new()));
        SegmentMan::new(Rc::new(RefCell::new(ps)))
    }

    #[test]
    fn test_distinct_segments_per_task() {
        let mut sm = man(Some(3000), 1000);
        let a = sm.get_segment(1).unwrap();
        let b = sm.get_segment(2).unwrap();
        assert_ne!(a.index, b.index);
        // Asking again returns the held segment
        assert_eq!(sm.get_segment(1).unwrap().index, a.index);
        assert_eq!(sm.count_free_segments(), 1);
    }

    #[test]
    fn test_complete_and_cancel() {
        let mut sm = man(Some(2000), 1000);
        let mut a = sm.get_segment(1).unwrap();
        a.written = 1000;
        assert!(a.is_complete());
        sm.complete_segment(1, &a);
        assert!(sm.piece_storage().borrow().has_piece(0));

        let _ = sm.get_segment(2).unwrap();
        sm.cancel_segment(2);
        assert_eq!(sm.count_free_segments(), 1);
        assert_eq!(sm.count_used_segments(), 0);
    }

    #[test]
    fn test_unknown_length_single_stream() {
        let mut sm = man(None, 1024);
        let seg = sm.get_segment(7).unwrap();
        assert!(seg.is_open_ended());
        assert!(sm.get_segment(8).is_none());
        assert_eq!(sm.count_free_segments(), 0);
    }
}
