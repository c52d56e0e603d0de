//! # indexreaper
//!
//! Reconciliation and compaction for the index of a multi-tenant
//! time-series store. The index is a **mergeset**: a directory of
//! immutable, lexicographically sorted parts of byte-string items, each
//! item tagged with a one-byte namespace.
//!
//! A sweep finds metric IDs that the index knows about but that own no
//! stored sample block in a partition, marks them deleted and purges them
//! from disk with a forced, disk-space-aware merge.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use indexreaper::{Storage, StorageConfig, SweepConfig, Sweeper};
//!
//! let storage = Storage::open("/var/lib/vmstorage-data", StorageConfig::default()).unwrap();
//!
//! let config = SweepConfig::default().with_tenant_names(["0:0"]).unwrap();
//! let report = Sweeper::new(&storage, config).run().unwrap();
//! println!("purged {} metric IDs", report.total_without_data());
//!
//! storage.close().unwrap();
//! ```
//!
//! ## Layers
//!
//! - [`part`]: the immutable sorted part file, its cursor and its order
//!   validator.
//! - [`mergeset`]: the table of parts, filtering merges and the forced-merge
//!   scheduler.
//! - [`storage`]: index namespaces, the deleted-metric-ID set, block headers
//!   and partitions.
//! - [`sweep`]: the find-orphans, mark-deleted, force-merge workflow.
//!
//! Every on-disk structure is CRC32-checked; every error type tells fatal
//! corruption apart from recoverable conditions through `is_fatal()`.

pub mod encoding;
pub mod mergeset;
pub mod part;
pub mod storage;
pub mod sweep;

pub use mergeset::{ForceMergeStats, StopSignal, Table, TableConfig, TableError};
pub use part::{Part, PartError, validate_order};
pub use storage::{
    Deadline, MetricName, Partition, Storage, StorageConfig, StorageError, StorageMetrics,
    TagFilter, Tenant, TimeRange, Tsid,
};
pub use sweep::{PartitionReport, SweepConfig, SweepReport, Sweeper};

/// Error of a sweep, the outermost error of the crate.
pub use sweep::SweepError as Error;
