//! # Storage
//!
//! Minimal partitioned store around the index: a [`Storage`] directory
//! holds monthly [`Partition`]s, each owning an index table
//! ([`IndexDb`]) and a block-header store ([`BlockStore`]).
//!
//! ```text
//! <path>/partitions/
//!     2024_05/
//!         index/     parts + parts.manifest
//!         blocks/    NNNNNN.blocks
//!     2024_06/
//!         ...
//! ```
//!
//! Partitions are handed out with [`Storage::get_partitions`] and must be
//! returned with [`Storage::put_partitions`]; [`Storage::close`] refuses
//! to run while any are checked out.

pub mod blocks;
pub mod deleted;
pub mod index_db;
pub mod keys;
pub mod metric_name;
pub mod partition;
pub mod tsid;

#[cfg(test)]
mod tests;

pub use blocks::{BlockHeader, BlockStore, PartitionSearch};
pub use deleted::{DeletedItemsFilter, DeletedMetricIds};
pub use index_db::IndexDb;
pub use metric_name::{MetricName, Tag, TagFilter};
pub use partition::{MetricIdDays, Partition};
pub use tsid::{ParseTenantError, Tenant, Tsid};

pub use crate::mergeset::StopSignal;

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::encoding::EncodingError;
use crate::mergeset::{TableConfig, TableError};
use crate::part::PartError;

const PARTITIONS_DIR: &str = "partitions";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Error from an index table.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Error from a part read directly.
    #[error("Part error: {0}")]
    Part(#[from] PartError),

    /// Stored data could not be interpreted.
    #[error("corrupted data: {0}")]
    Corruption(String),

    /// Stored and computed CRC32 differ.
    #[error("checksum mismatch in {what} of {path:?}")]
    ChecksumMismatch {
        /// File that failed verification.
        path: PathBuf,
        /// Which structure failed verification.
        what: &'static str,
    },

    /// TSIDs handed to a presence search are not sorted.
    #[error("TSIDs are not sorted at position {index}")]
    UnsortedTsids {
        /// First position that is smaller than its predecessor.
        index: usize,
    },

    /// A read query ran past its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Partition name is not `YYYY_MM`.
    #[error("invalid partition name {0:?}")]
    InvalidPartitionName(String),

    /// Query arguments are unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Partitions are still checked out.
    #[error("{0} partitions are still in use")]
    PartitionsInUse(usize),

    /// The storage was closed.
    #[error("storage is closed")]
    Closed,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether the error signals corruption, as opposed to a failed query,
    /// a bad argument or an I/O hiccup.
    pub fn is_fatal(&self) -> bool {
        match self {
            StorageError::Table(e) => e.is_fatal(),
            StorageError::Part(e) => e.is_fatal(),
            StorageError::Encoding(_)
            | StorageError::Corruption(_)
            | StorageError::ChecksumMismatch { .. }
            | StorageError::Internal(_) => true,
            StorageError::Io(_)
            | StorageError::UnsortedTsids { .. }
            | StorageError::DeadlineExceeded
            | StorageError::InvalidPartitionName(_)
            | StorageError::InvalidArgument(_)
            | StorageError::InvalidConfig(_)
            | StorageError::PartitionsInUse(_)
            | StorageError::Closed => false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Query helpers
// ------------------------------------------------------------------------------------------------

/// Iterations between two deadline checks in read scans.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

/// Point in time after which read queries fail instead of continuing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self(None)
    }

    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Deadline at `instant`.
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Whether the deadline has passed.
    pub fn exceeded(&self) -> bool {
        self.0.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails with [`StorageError::DeadlineExceeded`] on every 1024th
    /// iteration (including the first) once the deadline has passed.
    pub(crate) fn check(&self, iteration: u64) -> Result<(), StorageError> {
        if iteration % DEADLINE_CHECK_INTERVAL == 0 && self.exceeded() {
            return Err(StorageError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Inclusive millisecond time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// First millisecond.
    pub min_timestamp: i64,
    /// Last millisecond.
    pub max_timestamp: i64,
}

impl TimeRange {
    /// Whether `[min, max]` intersects the range.
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        min <= self.max_timestamp && max >= self.min_timestamp
    }

    /// Whether `ts` lies inside the range.
    pub fn contains(&self, ts: i64) -> bool {
        self.min_timestamp <= ts && ts <= self.max_timestamp
    }

    /// First and last day number covered.
    pub fn dates(&self) -> (u64, u64) {
        (
            keys::date_of(self.min_timestamp),
            keys::date_of(self.max_timestamp),
        )
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Storage configuration.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Partitions whose range ended longer ago than this are hidden from
    /// [`Storage::get_partitions`]. `None` disables retention.
    pub retention: Option<Duration>,

    /// Configuration of every partition's index table.
    pub table: TableConfig,
}

impl StorageConfig {
    /// Checks parameter ranges.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.retention.is_some_and(|r| r.is_zero()) {
            return Err(StorageError::InvalidConfig(
                "retention must be > 0 when set".into(),
            ));
        }
        self.table
            .validate()
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))
    }
}

/// Point-in-time storage statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageMetrics {
    /// Open partitions.
    pub partitions: usize,
    /// Index parts across partitions.
    pub index_parts: usize,
    /// Index items across partitions.
    pub index_items: u64,
    /// Index bytes on disk.
    pub index_size_bytes: u64,
    /// Stored block headers.
    pub blocks: u64,
    /// Rows in stored blocks.
    pub rows: u64,
    /// Deleted metric IDs across partitions.
    pub deleted_metric_ids: usize,
    /// Partitions currently checked out.
    pub partitions_in_use: usize,
}

// ------------------------------------------------------------------------------------------------
// Storage
// ------------------------------------------------------------------------------------------------

/// Partitioned store.
#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    config: StorageConfig,
    partitions: RwLock<BTreeMap<String, Arc<Partition>>>,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

impl Storage {
    /// Opens (or creates) the storage at `path`, opening every partition
    /// found on disk.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let partitions_dir = path.join(PARTITIONS_DIR);
        fs::create_dir_all(&partitions_dir)?;

        let mut partitions = BTreeMap::new();
        for entry in fs::read_dir(&partitions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if partition::parse_partition_name(&name).is_err() {
                warn!(path = ?entry.path(), "ignoring directory with an invalid partition name");
                continue;
            }
            let pt = Partition::open(&entry.path(), &name, &config.table)?;
            partitions.insert(name, Arc::new(pt));
        }

        info!(path = ?path, partitions = partitions.len(), "storage opened");
        Ok(Self {
            path,
            config,
            partitions: RwLock::new(partitions),
            in_use: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Storage root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn poisoned<T>(_: T) -> StorageError {
        error!("storage lock poisoned");
        StorageError::Internal("RwLock poisoned".into())
    }

    /// Returns the partition named `name` (`YYYY_MM`), creating it if
    /// needed.
    pub fn create_partition(&self, name: &str) -> Result<Arc<Partition>, StorageError> {
        self.ensure_open()?;
        partition::parse_partition_name(name)?;

        let mut partitions = self.partitions.write().map_err(Self::poisoned)?;
        if let Some(pt) = partitions.get(name) {
            return Ok(Arc::clone(pt));
        }
        let dir = self.path.join(PARTITIONS_DIR).join(name);
        let pt = Arc::new(Partition::open(&dir, name, &self.config.table)?);
        partitions.insert(name.to_string(), Arc::clone(&pt));
        info!(partition = %name, "partition created");
        Ok(pt)
    }

    /// Returns the partition covering `timestamp_ms`, creating it if
    /// needed.
    pub fn partition_for_timestamp(&self, timestamp_ms: i64) -> Result<Arc<Partition>, StorageError> {
        self.create_partition(&partition::partition_name_for_timestamp(timestamp_ms)?)
    }

    /// Checks out every partition inside the retention window, ordered by
    /// name. Pair with [`put_partitions`](Self::put_partitions).
    pub fn get_partitions(&self) -> Result<Vec<Arc<Partition>>, StorageError> {
        self.ensure_open()?;
        let min_ts = self.config.retention.map(|r| {
            let retention_ms = i64::try_from(r.as_millis()).unwrap_or(i64::MAX);
            now_ms().saturating_sub(retention_ms)
        });

        let partitions = self.partitions.read().map_err(Self::poisoned)?;
        let out: Vec<_> = partitions
            .values()
            .filter(|pt| min_ts.is_none_or(|min| pt.time_range().max_timestamp >= min))
            .cloned()
            .collect();
        self.in_use.fetch_add(out.len(), Ordering::AcqRel);
        Ok(out)
    }

    /// Returns partitions obtained from [`get_partitions`](Self::get_partitions).
    pub fn put_partitions(&self, partitions: Vec<Arc<Partition>>) {
        let n = partitions.len();
        drop(partitions);
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
    }

    /// Aggregated statistics.
    pub fn metrics(&self) -> Result<StorageMetrics, StorageError> {
        let partitions = self.partitions.read().map_err(Self::poisoned)?;
        let mut m = StorageMetrics {
            partitions: partitions.len(),
            partitions_in_use: self.in_use.load(Ordering::Acquire),
            ..StorageMetrics::default()
        };
        for pt in partitions.values() {
            let t = pt.index_db().table().metrics()?;
            m.index_parts += t.parts_count;
            m.index_items += t.items_count;
            m.index_size_bytes += t.size_bytes;
            let (blocks, rows) = pt.block_store().counts()?;
            m.blocks += blocks;
            m.rows += rows;
            m.deleted_metric_ids += pt.index_db().deleted_metric_ids().len();
        }
        Ok(m)
    }

    /// Closes the storage.
    ///
    /// # Errors
    ///
    /// [`StorageError::PartitionsInUse`] while partitions are checked out.
    pub fn close(&self) -> Result<(), StorageError> {
        let in_use = self.in_use.load(Ordering::Acquire);
        if in_use > 0 {
            return Err(StorageError::PartitionsInUse(in_use));
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.partitions.write().map_err(Self::poisoned)?.clear();
        info!(path = ?self.path, "storage closed");
        Ok(())
    }
}
