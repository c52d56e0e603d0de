//! # Mergeset Table
//!
//! A [`Table`] is a directory of immutable sorted [`Part`]s plus a parts
//! manifest. It is the storage structure behind every partition's index.
//!
//! ## Lifecycle of a part
//!
//! ```text
//!   add_items ──► Free ──claim──► Claimed ──merge_parts──► Merging ──► retired
//!                  ▲                 │
//!                  └─────release─────┘
//! ```
//!
//! Claiming and releasing happen under the table's part-list lock, so two
//! schedulers can never select the same part. The state itself is an
//! [`AtomicU8`] so readers can inspect it without the lock.
//!
//! ## Merges
//!
//! [`Table::merge_parts`] streams a k-way merge of its inputs through the
//! table's optional [`ItemFilter`], writes one new part, validates its
//! ordering, and swaps it in: manifest first, then the in-memory list,
//! then the old files are unlinked. Readers holding an old part keep
//! their memory map until they drop it.
//!
//! [`Table::force_clean_all_parts`] runs one singleton merge per free
//! part under a free-disk-space check and a bounded admission gate.
//!
//! ## Sub-modules
//!
//! - [`merge`]: [`MergeIter`], the merged cursor.
//! - [`disk`]: [`FreeSpaceProbe`] and its `statvfs` implementation.

pub mod disk;
pub mod merge;
mod manifest;

#[cfg(test)]
mod tests;

pub use disk::{FreeSpaceProbe, StatvfsProbe};
pub use merge::{MergeCounts, MergeIter};

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
};

use crossbeam::channel;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::encoding::EncodingError;
use crate::part::{Part, PartError, PartWriter, validate_order};

use manifest::{PartsManifest, part_file_name};
use merge::FilteredItems;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Error from a part.
    #[error("Part error: {0}")]
    Part(#[from] PartError),

    /// Parts manifest failed verification.
    #[error("parts manifest checksum mismatch")]
    ManifestChecksumMismatch,

    /// An item could not be interpreted while filtering.
    #[error("corrupted item: {0}")]
    Corruption(String),

    /// A merge failed; the index cannot be safely mutated further.
    #[error("merge of part {path:?} failed: {source}")]
    MergeFailed {
        /// Path of the first input part.
        path: PathBuf,
        /// What went wrong.
        #[source]
        source: Box<TableError>,
    },

    /// A part handed to `merge_parts` was not claimed by the caller.
    #[error("part {id} is not claimed")]
    NotClaimed {
        /// Part id.
        id: u64,
    },

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TableError {
    /// Whether the error means the index may be corrupted and the current
    /// run must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            TableError::Part(e) => e.is_fatal(),
            TableError::Io(_) | TableError::NotClaimed { .. } | TableError::InvalidConfig(_) => {
                false
            }
            TableError::Encoding(_)
            | TableError::ManifestChecksumMismatch
            | TableError::Corruption(_)
            | TableError::MergeFailed { .. }
            | TableError::Internal(_) => true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Table configuration.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Upper bound on singleton merges running at once during a forced
    /// merge.
    pub max_concurrent_merges: usize,

    /// Target size of a part data block in bytes.
    pub block_size: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_concurrent_merges: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            block_size: crate::part::PART_DATA_BLOCK_MAX_SIZE,
        }
    }
}

impl TableConfig {
    /// Checks parameter ranges.
    pub fn validate(&self) -> Result<(), TableError> {
        if self.max_concurrent_merges < 1 {
            return Err(TableError::InvalidConfig(
                "max_concurrent_merges must be >= 1".into(),
            ));
        }
        if self.block_size < 1 {
            return Err(TableError::InvalidConfig("block_size must be >= 1".into()));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Filtering hooks
// ------------------------------------------------------------------------------------------------

/// Source of per-merge item filters.
///
/// `prepare` is called once at the start of every filtering merge.
/// Returning `None` turns the merge into a pass-through copy.
pub trait ItemFilter: Send + Sync {
    /// Snapshots whatever state the filter needs for one merge.
    fn prepare(&self) -> Option<Box<dyn PreparedFilter>>;
}

/// Filter frozen for the duration of one merge.
pub trait PreparedFilter {
    /// `Ok(true)` keeps the item. An error aborts the merge.
    fn retain(&self, item: &[u8]) -> Result<bool, TableError>;
}

// ------------------------------------------------------------------------------------------------
// Stop signal
// ------------------------------------------------------------------------------------------------

/// Cooperative stop flag. Raising it stops admission of new merges;
/// merges already running finish.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// A lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the signal was raised.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ------------------------------------------------------------------------------------------------
// PartWrapper
// ------------------------------------------------------------------------------------------------

/// Merge state of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartState {
    /// Eligible for a merge.
    Free = 0,
    /// Selected by a scheduler, not yet merging.
    Claimed = 1,
    /// Input of a running merge.
    Merging = 2,
}

impl PartState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PartState::Claimed,
            2 => PartState::Merging,
            _ => PartState::Free,
        }
    }
}

/// A live part of a table together with its merge state.
#[derive(Debug)]
pub struct PartWrapper {
    id: u64,
    part: Arc<Part>,
    state: AtomicU8,
}

impl PartWrapper {
    fn new(id: u64, part: Part) -> Self {
        Self {
            id,
            part: Arc::new(part),
            state: AtomicU8::new(PartState::Free as u8),
        }
    }

    /// Table-unique part id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The part.
    pub fn part(&self) -> &Arc<Part> {
        &self.part
    }

    /// Current merge state.
    pub fn state(&self) -> PartState {
        PartState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: PartState, to: PartState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Outcome of one [`Table::force_clean_all_parts`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForceMergeStats {
    /// Parts merged.
    pub merged: usize,

    /// Parts released because free space was below their size.
    pub skipped_for_space: usize,

    /// Parts released because the stop signal was raised.
    pub skipped_on_stop: usize,

    /// Items dropped by the filter across all merges.
    pub items_dropped: u64,
}

/// Point-in-time table statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableMetrics {
    /// Live parts.
    pub parts_count: usize,

    /// Items across live parts (duplicates across parts counted twice).
    pub items_count: u64,

    /// Bytes on disk across live parts.
    pub size_bytes: u64,

    /// Merges running right now.
    pub active_merges: usize,

    /// Highest number of merges observed running at once.
    pub peak_active_merges: usize,

    /// Merges completed since open.
    pub merges_total: u64,

    /// Items dropped by filtering merges since open.
    pub items_dropped_total: u64,
}

#[derive(Debug, Default)]
struct MergeCounters {
    active: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicU64,
    dropped: AtomicU64,
}

/// RAII marker for one running merge.
struct ActiveMerge<'a>(&'a MergeCounters);

impl<'a> ActiveMerge<'a> {
    fn enter(counters: &'a MergeCounters) -> Self {
        let now = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak.fetch_max(now, Ordering::AcqRel);
        Self(counters)
    }
}

impl Drop for ActiveMerge<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

struct TableInner {
    parts: Vec<Arc<PartWrapper>>,
    manifest: PartsManifest,
}

/// Directory of sorted parts with merge support.
pub struct Table {
    path: PathBuf,
    config: TableConfig,
    inner: Mutex<TableInner>,
    filter: Option<Arc<dyn ItemFilter>>,
    probe: Arc<dyn FreeSpaceProbe>,
    counters: MergeCounters,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Opens (or creates) the table stored in `path`.
    ///
    /// Part files not listed in the manifest and leftover temporary files
    /// are removed. Every listed part is opened and verified.
    pub fn open(path: impl AsRef<Path>, config: TableConfig) -> Result<Self, TableError> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let manifest = PartsManifest::open(&path)?;
        manifest.remove_orphans()?;

        let mut parts = Vec::with_capacity(manifest.part_ids().len());
        for &id in manifest.part_ids() {
            let part = Part::open(path.join(part_file_name(id)))?;
            parts.push(Arc::new(PartWrapper::new(id, part)));
        }

        info!(path = ?path, parts = parts.len(), "table opened");

        Ok(Self {
            path,
            config,
            inner: Mutex::new(TableInner { parts, manifest }),
            filter: None,
            probe: Arc::new(StatvfsProbe),
            counters: MergeCounters::default(),
        })
    }

    /// Installs the filter applied by filtering merges.
    pub fn with_filter(mut self, filter: Arc<dyn ItemFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Replaces the free-space probe used by forced merges.
    pub fn with_free_space_probe(mut self, probe: Arc<dyn FreeSpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Table directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, TableInner>, TableError> {
        self.inner.lock().map_err(|_| {
            error!("table mutex poisoned");
            TableError::Internal("Mutex poisoned".into())
        })
    }

    // --------------------------------------------------------------------------------------------
    // Writes and reads
    // --------------------------------------------------------------------------------------------

    /// Writes `items` as one new part. Items are sorted and deduplicated
    /// first; an empty batch is a no-op.
    pub fn add_items<I>(&self, items: I) -> Result<(), TableError>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut items: Vec<Vec<u8>> = items.into_iter().collect();
        if items.is_empty() {
            return Ok(());
        }
        items.sort_unstable();
        items.dedup();

        let id = self.lock_inner()?.manifest.allocate_part_id();
        let part_path = self.path.join(part_file_name(id));
        PartWriter::new(&part_path)
            .with_block_size(self.config.block_size)
            .build(&items)?;
        let part = Part::open(&part_path)?;

        let mut inner = self.lock_inner()?;
        inner.manifest.commit(Some(id), &[])?;
        inner.parts.push(Arc::new(PartWrapper::new(id, part)));

        debug!(path = ?part_path, items = items.len(), "part added");
        Ok(())
    }

    /// Snapshot of the live parts.
    pub fn get_file_parts(&self) -> Result<Vec<Arc<PartWrapper>>, TableError> {
        Ok(self.lock_inner()?.parts.clone())
    }

    /// Merged cursor over a snapshot of the live parts.
    pub fn search(&self) -> Result<MergeIter<Arc<Part>>, TableError> {
        let parts = self.lock_inner()?.parts.clone();
        Ok(MergeIter::new(parts.iter().map(|pw| Arc::clone(&pw.part))))
    }

    /// Current statistics.
    pub fn metrics(&self) -> Result<TableMetrics, TableError> {
        let inner = self.lock_inner()?;
        Ok(TableMetrics {
            parts_count: inner.parts.len(),
            items_count: inner.parts.iter().map(|pw| pw.part.items_count()).sum(),
            size_bytes: inner.parts.iter().map(|pw| pw.part.size_bytes()).sum(),
            active_merges: self.counters.active.load(Ordering::Acquire),
            peak_active_merges: self.counters.peak.load(Ordering::Acquire),
            merges_total: self.counters.total.load(Ordering::Acquire),
            items_dropped_total: self.counters.dropped.load(Ordering::Acquire),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Claiming
    // --------------------------------------------------------------------------------------------

    /// Claims every free part.
    pub fn claim_free_parts(&self) -> Result<Vec<Arc<PartWrapper>>, TableError> {
        let inner = self.lock_inner()?;
        Ok(inner
            .parts
            .iter()
            .filter(|pw| pw.transition(PartState::Free, PartState::Claimed))
            .cloned()
            .collect())
    }

    /// Returns claimed (or failed merging) parts to the free pool.
    pub fn release_parts(&self, parts: &[Arc<PartWrapper>]) -> Result<(), TableError> {
        let _inner = self.lock_inner()?;
        for pw in parts {
            pw.state.store(PartState::Free as u8, Ordering::Release);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Merging
    // --------------------------------------------------------------------------------------------

    /// Merges claimed `parts` into one part and swaps it in.
    ///
    /// With `filter_deleted` the table's [`ItemFilter`] decides which items
    /// survive; when the filter has nothing to drop the merge is a plain
    /// copy. If nothing survives no part is written and the inputs are
    /// retired. On error the inputs are released untouched.
    ///
    /// # Errors
    ///
    /// - [`TableError::NotClaimed`] if any input is not in the `Claimed`
    ///   state.
    /// - Filter, read or write errors from the merge itself.
    pub fn merge_parts(
        &self,
        parts: &[Arc<PartWrapper>],
        filter_deleted: bool,
    ) -> Result<MergeCounts, TableError> {
        if parts.is_empty() {
            return Ok(MergeCounts::default());
        }
        for (i, pw) in parts.iter().enumerate() {
            if !pw.transition(PartState::Claimed, PartState::Merging) {
                // Roll back the transitions already made.
                for done in &parts[..i] {
                    done.transition(PartState::Merging, PartState::Claimed);
                }
                return Err(TableError::NotClaimed { id: pw.id });
            }
        }

        let _active = ActiveMerge::enter(&self.counters);
        let result = self.merge_claimed(parts, filter_deleted);
        if result.is_err() {
            self.release_parts(parts)?;
        }
        result
    }

    fn merge_claimed(
        &self,
        parts: &[Arc<PartWrapper>],
        filter_deleted: bool,
    ) -> Result<MergeCounts, TableError> {
        let prepared = match (&self.filter, filter_deleted) {
            (Some(filter), true) => filter.prepare(),
            _ => None,
        };

        let new_id = self.lock_inner()?.manifest.allocate_part_id();
        let new_path = self.path.join(part_file_name(new_id));

        let mut iter = MergeIter::new(parts.iter().map(|pw| Arc::clone(&pw.part)));
        let mut items = FilteredItems::new(&mut iter, prepared.as_deref());
        let built = PartWriter::new(&new_path)
            .with_block_size(self.config.block_size)
            .build(&mut items);
        if let Some(e) = items.err.take() {
            if built.is_ok() {
                fs::remove_file(&new_path)?;
            }
            return Err(e);
        }
        let counts = items.counts;

        let new_part = match built {
            Ok(_) => {
                let part = Part::open(&new_path)?;
                if let Err(e) = validate_order(&part) {
                    error!(path = ?new_path, error = %e, "merged part failed order validation");
                    drop(part);
                    fs::remove_file(&new_path)?;
                    return Err(e.into());
                }
                Some(PartWrapper::new(new_id, part))
            }
            Err(PartError::Empty) => None,
            Err(e) => return Err(e.into()),
        };

        self.swap_parts(parts, new_part)?;

        self.counters.total.fetch_add(1, Ordering::AcqRel);
        self.counters
            .dropped
            .fetch_add(counts.items_dropped, Ordering::AcqRel);
        debug!(
            inputs = parts.len(),
            items_in = counts.items_in,
            items_dropped = counts.items_dropped,
            output = ?new_path,
            "merge finished"
        );
        Ok(counts)
    }

    /// Replaces `old` with `new` in the manifest and the part list, then
    /// unlinks the old files.
    fn swap_parts(
        &self,
        old: &[Arc<PartWrapper>],
        new: Option<PartWrapper>,
    ) -> Result<(), TableError> {
        let removed: Vec<u64> = old.iter().map(|pw| pw.id).collect();
        {
            let mut inner = self.lock_inner()?;
            inner.manifest.commit(new.as_ref().map(|pw| pw.id), &removed)?;
            inner.parts.retain(|pw| !removed.contains(&pw.id));
            if let Some(pw) = new {
                inner.parts.push(Arc::new(pw));
            }
        }

        for pw in old {
            if let Err(e) = fs::remove_file(pw.part.path()) {
                warn!(path = ?pw.part.path(), error = %e, "failed to remove merged part file");
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Forced merge
    // --------------------------------------------------------------------------------------------

    /// Rewrites every free part through a filtering singleton merge.
    ///
    /// Each claimed part is checked against the free space of the table
    /// path: a shortfall is logged and the part released for a later
    /// call. Admitted merges run on scoped threads, at most
    /// `max_concurrent_merges` at a time, and all of them are joined
    /// before this returns. Once `stop` is raised no further merge is
    /// admitted.
    ///
    /// # Errors
    ///
    /// The first merge failure, wrapped in [`TableError::MergeFailed`], or
    /// a free-space probe failure. Both are reported only after every
    /// running merge has finished.
    pub fn force_clean_all_parts(&self, stop: &StopSignal) -> Result<ForceMergeStats, TableError> {
        let claimed = self.claim_free_parts()?;
        let mut stats = ForceMergeStats::default();
        if claimed.is_empty() {
            debug!(path = ?self.path, "no free parts to merge");
            return Ok(stats);
        }
        info!(path = ?self.path, parts = claimed.len(), "forced merge started");

        let (gate_tx, gate_rx) = channel::bounded::<()>(self.config.max_concurrent_merges);
        let failure: Mutex<Option<TableError>> = Mutex::new(None);
        let dropped = AtomicU64::new(0);

        let admitted = crossbeam::thread::scope(|s| -> Result<(), TableError> {
            let mut pending = claimed.into_iter();
            while let Some(pw) = pending.next() {
                let failed = failure
                    .lock()
                    .map(|f| f.is_some())
                    .unwrap_or(true);
                if failed {
                    let mut rest = vec![pw];
                    rest.extend(pending.by_ref());
                    self.release_parts(&rest)?;
                    break;
                }

                if stop.is_raised() {
                    stats.skipped_on_stop += 1;
                    self.release_parts(std::slice::from_ref(&pw))?;
                    continue;
                }

                let needed = pw.part.size_bytes();
                let available = match self.probe.available_bytes(&self.path) {
                    Ok(available) => available,
                    Err(e) => {
                        let mut rest = vec![pw];
                        rest.extend(pending.by_ref());
                        self.release_parts(&rest)?;
                        return Err(e.into());
                    }
                };
                if available < needed {
                    warn!(
                        path = ?pw.part.path(),
                        needed,
                        available,
                        missing = needed - available,
                        "not enough free space for merge, skipping part"
                    );
                    stats.skipped_for_space += 1;
                    self.release_parts(std::slice::from_ref(&pw))?;
                    continue;
                }

                // Blocks while the gate is full.
                gate_tx
                    .send(())
                    .map_err(|_| TableError::Internal("merge gate closed".into()))?;
                stats.merged += 1;

                let gate_rx = gate_rx.clone();
                let failure = &failure;
                let dropped = &dropped;
                s.spawn(move |_| {
                    let result = self.merge_parts(std::slice::from_ref(&pw), true);
                    match result {
                        Ok(counts) => {
                            dropped.fetch_add(counts.items_dropped, Ordering::AcqRel);
                        }
                        Err(e) => {
                            error!(path = ?pw.part.path(), error = %e, "forced merge failed");
                            if let Ok(mut slot) = failure.lock() {
                                slot.get_or_insert(TableError::MergeFailed {
                                    path: pw.part.path().to_path_buf(),
                                    source: Box::new(e),
                                });
                            }
                        }
                    }
                    let _ = gate_rx.recv();
                });
            }
            Ok(())
        })
        .map_err(|_| TableError::Internal("merge worker panicked".into()))?;

        admitted?;
        let failure = failure
            .into_inner()
            .map_err(|_| TableError::Internal("Mutex poisoned".into()))?;
        if let Some(e) = failure {
            return Err(e);
        }

        stats.items_dropped = dropped.load(Ordering::Acquire);
        info!(
            path = ?self.path,
            merged = stats.merged,
            skipped_for_space = stats.skipped_for_space,
            skipped_on_stop = stats.skipped_on_stop,
            items_dropped = stats.items_dropped,
            "forced merge finished"
        );
        Ok(stats)
    }
}
