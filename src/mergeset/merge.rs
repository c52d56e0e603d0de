//! Heap-based k-way merge over part cursors.
//!
//! [`MergeIter`] combines several [`PartSearch`] cursors into one cursor
//! with the same `seek` / `next_item` / `item` / `error` contract. Items
//! are yielded in ascending byte order; an item present in more than one
//! source is yielded once.
//!
//! The first error reported by any source stops the merged iteration and
//! is kept in [`MergeIter::error`].

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    ops::Deref,
};

use crate::part::{Part, PartError, PartSearch};

use super::{PreparedFilter, TableError};

// ------------------------------------------------------------------------------------------------
// Heap entry
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    item: Vec<u8>,
    source_idx: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: smallest item pops first, ties by source index.
        self.item
            .cmp(&other.item)
            .then(self.source_idx.cmp(&other.source_idx))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

// ------------------------------------------------------------------------------------------------
// MergeIter
// ------------------------------------------------------------------------------------------------

/// Merged cursor over several parts.
pub struct MergeIter<P: Deref<Target = Part>> {
    sources: Vec<PartSearch<P>>,
    heap: BinaryHeap<HeapEntry>,
    current: Vec<u8>,
    has_current: bool,
    err: Option<PartError>,
}

impl<P: Deref<Target = Part>> MergeIter<P> {
    /// Builds an unpositioned cursor over `parts`.
    pub fn new(parts: impl IntoIterator<Item = P>) -> Self {
        let sources: Vec<_> = parts.into_iter().map(PartSearch::new).collect();
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            current: Vec::new(),
            has_current: false,
            err: None,
        }
    }

    /// Positions every source at the first item `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.heap.clear();
        self.err = None;
        self.has_current = false;
        self.current.clear();

        for idx in 0..self.sources.len() {
            self.sources[idx].seek(key);
            self.pull(idx);
        }
    }

    /// Advances to the next distinct item. Returns `false` at the end or on
    /// error.
    pub fn next_item(&mut self) -> bool {
        loop {
            if self.err.is_some() {
                return false;
            }
            let Some(entry) = self.heap.pop() else {
                return false;
            };
            self.pull(entry.source_idx);
            if self.err.is_some() {
                return false;
            }

            if self.has_current && entry.item == self.current {
                continue;
            }
            self.current = entry.item;
            self.has_current = true;
            return true;
        }
    }

    /// The current item.
    pub fn item(&self) -> &[u8] {
        &self.current
    }

    /// Terminal error, distinct from exhaustion.
    pub fn error(&self) -> Option<&PartError> {
        self.err.as_ref()
    }

    /// Takes the terminal error out of the cursor.
    pub fn take_error(&mut self) -> Option<PartError> {
        self.err.take()
    }

    /// Refills the heap from source `idx`.
    fn pull(&mut self, idx: usize) {
        let source = &mut self.sources[idx];
        if source.next_item() {
            self.heap.push(HeapEntry {
                item: source.item().to_vec(),
                source_idx: idx,
            });
        } else if let Some(e) = source.take_error() {
            self.err.get_or_insert(e);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Filtered stream fed to the part writer
// ------------------------------------------------------------------------------------------------

/// Counters of one merge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeCounts {
    /// Items read from the inputs (after cross-part dedup).
    pub items_in: u64,

    /// Items dropped by the filter.
    pub items_dropped: u64,
}

/// Iterator adapter that applies an optional [`PreparedFilter`] to a
/// [`MergeIter`] and parks the first error instead of yielding it, since
/// the part writer consumes a plain item stream.
pub(crate) struct FilteredItems<'a, P: Deref<Target = Part>> {
    iter: &'a mut MergeIter<P>,
    filter: Option<&'a dyn PreparedFilter>,
    pub(crate) counts: MergeCounts,
    pub(crate) err: Option<TableError>,
}

impl<'a, P: Deref<Target = Part>> FilteredItems<'a, P> {
    pub(crate) fn new(iter: &'a mut MergeIter<P>, filter: Option<&'a dyn PreparedFilter>) -> Self {
        iter.seek(&[]);
        Self {
            iter,
            filter,
            counts: MergeCounts::default(),
            err: None,
        }
    }
}

impl<P: Deref<Target = Part>> Iterator for FilteredItems<'_, P> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.err.is_some() {
            return None;
        }
        loop {
            if !self.iter.next_item() {
                if let Some(e) = self.iter.take_error() {
                    self.err = Some(e.into());
                }
                return None;
            }
            self.counts.items_in += 1;

            let item = self.iter.item();
            let keep = match self.filter {
                None => true,
                Some(filter) => match filter.retain(item) {
                    Ok(keep) => keep,
                    Err(e) => {
                        self.err = Some(e);
                        return None;
                    }
                },
            };
            if keep {
                return Some(item.to_vec());
            }
            self.counts.items_dropped += 1;
        }
    }
}
