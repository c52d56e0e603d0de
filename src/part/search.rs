//! Seek-and-iterate cursor over a single part.
//!
//! [`PartSearch`] follows the classic cursor contract used by the index
//! readers and the merge engine:
//!
//! ```rust,ignore
//! let mut ps = part.search();
//! ps.seek(prefix);
//! while ps.next_item() {
//!     let item = ps.item();
//!     if !item.starts_with(prefix) { break; }
//!     // ...
//! }
//! if let Some(err) = ps.error() { /* corruption, not end of data */ }
//! ```
//!
//! Items are yielded in ascending lexicographic order of their full bytes.
//! `seek` may be called again from any state, including after exhaustion.
//! Data blocks are CRC-checked as they are loaded; a failure stops the
//! iteration and is kept in [`PartSearch::error`].

use std::ops::{Deref, Range};

use crate::encoding;

use super::{Part, PartError};

/// Cursor over the items of one [`Part`].
///
/// Generic over the handle type so it can borrow a part (`&Part`) or keep
/// a shared one alive (`Arc<PartWrapper>` derefs through the table).
pub struct PartSearch<P: Deref<Target = Part>> {
    part: P,

    /// Index of the loaded data block.
    block_idx: usize,

    /// Content range of the loaded data block, `None` before the first
    /// seek or after exhaustion.
    block: Option<Range<usize>>,

    /// Offset of the next encoded item inside the mmap.
    cursor: usize,

    /// Range of the current item inside the mmap.
    item: Range<usize>,

    err: Option<PartError>,
}

impl<P: Deref<Target = Part>> PartSearch<P> {
    /// Creates an unpositioned cursor.
    pub fn new(part: P) -> Self {
        Self {
            part,
            block_idx: 0,
            block: None,
            cursor: 0,
            item: 0..0,
            err: None,
        }
    }

    /// The part being searched.
    pub fn part(&self) -> &Part {
        &self.part
    }

    /// Positions the cursor so that the next call to [`next_item`] returns
    /// the first item `>= key`.
    ///
    /// Clears any error recorded by a previous iteration.
    ///
    /// [`next_item`]: PartSearch::next_item
    pub fn seek(&mut self, key: &[u8]) {
        self.err = None;
        self.item = 0..0;

        let idx = self.part.find_block_for_key(key);
        if !self.load_block(idx) {
            return;
        }

        // Linear scan inside the block; blocks are small.
        while let Some(range) = self.block.clone() {
            if self.cursor >= range.end {
                return;
            }
            match self.decode_at(self.cursor, range.end) {
                Ok((item, next)) => {
                    if &self.part.bytes()[item] >= key {
                        return;
                    }
                    self.cursor = next;
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    /// Advances to the next item. Returns `false` at the end of data or on
    /// error; use [`error`] to tell the two apart.
    ///
    /// [`error`]: PartSearch::error
    pub fn next_item(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        loop {
            let Some(range) = self.block.clone() else {
                return false;
            };

            if self.cursor < range.end {
                return match self.decode_at(self.cursor, range.end) {
                    Ok((item, next)) => {
                        self.item = item;
                        self.cursor = next;
                        true
                    }
                    Err(e) => {
                        self.fail(e);
                        false
                    }
                };
            }

            let next_idx = self.block_idx + 1;
            if !self.load_block(next_idx) {
                return false;
            }
        }
    }

    /// The item returned by the last successful [`next_item`] call.
    ///
    /// [`next_item`]: PartSearch::next_item
    pub fn item(&self) -> &[u8] {
        &self.part.bytes()[self.item.clone()]
    }

    /// Terminal error of the iteration, distinct from ordinary exhaustion.
    pub fn error(&self) -> Option<&PartError> {
        self.err.as_ref()
    }

    /// Takes the terminal error out of the cursor.
    pub fn take_error(&mut self) -> Option<PartError> {
        self.err.take()
    }

    /// Loads block `idx`. Returns `false` when there is no such block or it
    /// failed verification.
    fn load_block(&mut self, idx: usize) -> bool {
        match self.part.data_block(idx) {
            Ok(Some(range)) => {
                self.block_idx = idx;
                self.cursor = range.start;
                self.block = Some(range);
                true
            }
            Ok(None) => {
                self.block = None;
                false
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    /// Decodes the item at `offset`, returning its range and the offset of
    /// the following item.
    fn decode_at(&self, offset: usize, end: usize) -> Result<(Range<usize>, usize), PartError> {
        let (bytes, consumed) = encoding::decode_bytes(&self.part.bytes()[offset..end])?;
        let next = offset + consumed;
        Ok((next - bytes.len()..next, next))
    }

    fn fail(&mut self, e: PartError) {
        tracing::warn!(path = ?self.part.path(), error = %e, "part search stopped on error");
        self.block = None;
        self.err = Some(e);
    }
}
