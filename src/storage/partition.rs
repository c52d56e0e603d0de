//! Monthly partition: one index plus one block-header store.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, NaiveDate};
use tracing::{debug, info};

use crate::mergeset::{ForceMergeStats, StopSignal, TableConfig};
use crate::part::validate_order;

use super::blocks::{BlockHeader, BlockStore};
use super::index_db::IndexDb;
use super::keys;
use super::metric_name::MetricName;
use super::tsid::{Tenant, Tsid};
use super::{Deadline, StorageError, TimeRange};

const INDEX_DIR: &str = "index";
const BLOCKS_DIR: &str = "blocks";

/// Blocks between two progress lines of a data-presence scan.
const PRESENCE_PROGRESS_INTERVAL: u64 = 1_000_000;

/// Upper bound on the days looked at by [`Partition::search_days_for_metric_ids`].
const MAX_SEARCH_DAYS: u64 = 180;

/// Time range of the partition named `YYYY_MM`.
pub(crate) fn parse_partition_name(name: &str) -> Result<TimeRange, StorageError> {
    let invalid = || StorageError::InvalidPartitionName(name.to_string());

    let (year, month) = name.split_once('_').ok_or_else(invalid)?;
    if year.len() != 4 || month.len() != 2 {
        return Err(invalid());
    }
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;

    let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let end = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(invalid)?;

    let ms = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
    match (ms(start), ms(end)) {
        (Some(min), Some(next)) => Ok(TimeRange {
            min_timestamp: min,
            max_timestamp: next - 1,
        }),
        _ => Err(invalid()),
    }
}

/// Name of the partition covering `timestamp_ms`.
pub(crate) fn partition_name_for_timestamp(timestamp_ms: i64) -> Result<String, StorageError> {
    let dt = DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
        StorageError::InvalidArgument(format!("timestamp {timestamp_ms} out of range"))
    })?;
    if !(0..=9999).contains(&dt.year()) {
        return Err(StorageError::InvalidArgument(format!(
            "timestamp {timestamp_ms} out of range"
        )));
    }
    Ok(dt.format("%Y_%m").to_string())
}

/// Days on which one metric ID has per-day index items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricIdDays {
    /// The metric ID.
    pub metric_id: u64,
    /// `YYYY-MM-DD` days, most recent first.
    pub days: Vec<String>,
}

/// Time-bounded shard owning an index and the headers of its blocks.
#[derive(Debug)]
pub struct Partition {
    name: String,
    path: PathBuf,
    tr: TimeRange,
    idb: IndexDb,
    blocks: BlockStore,
}

impl Partition {
    /// Opens (or creates) the partition `name` stored in `dir`.
    pub(crate) fn open(dir: &Path, name: &str, config: &TableConfig) -> Result<Self, StorageError> {
        let tr = parse_partition_name(name)?;
        let idb = IndexDb::open(dir.join(INDEX_DIR), config)?;
        let blocks = BlockStore::open(dir.join(BLOCKS_DIR))?;
        debug!(partition = %name, path = ?dir, "partition opened");
        Ok(Self {
            name: name.to_string(),
            path: dir.to_path_buf(),
            tr,
            idb,
            blocks,
        })
    }

    /// `YYYY_MM`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inclusive time range covered.
    pub fn time_range(&self) -> TimeRange {
        self.tr
    }

    /// The partition index.
    pub fn index_db(&self) -> &IndexDb {
        &self.idb
    }

    /// The partition block headers.
    pub fn block_store(&self) -> &BlockStore {
        &self.blocks
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Tenants with index data inside the partition range, ascending.
    pub fn search_tenants(&self, deadline: Deadline) -> Result<Vec<Tenant>, StorageError> {
        self.idb.search_tenants(self.tr, deadline)
    }

    /// Every TSID of `tenant`.
    pub fn search_tsid(&self, tenant: Tenant, deadline: Deadline) -> Result<Vec<Tsid>, StorageError> {
        self.idb.get_tsids(tenant, deadline)
    }

    /// TSIDs of `tenant` named exactly `name`.
    pub fn search_tsid_by_name(
        &self,
        tenant: Tenant,
        name: &[u8],
        deadline: Deadline,
    ) -> Result<Vec<Tsid>, StorageError> {
        self.idb.get_tsids_by_name(tenant, name, deadline)
    }

    /// Metric IDs among the sorted `tsids` that own at least one block
    /// overlapping the partition range.
    ///
    /// # Errors
    ///
    /// - [`StorageError::UnsortedTsids`] for unsorted input.
    /// - Any error the block scan hit, including
    ///   [`StorageError::DeadlineExceeded`].
    pub fn search_metric_ids_with_data(
        &self,
        tsids: &[Tsid],
        deadline: Deadline,
    ) -> Result<HashSet<u64>, StorageError> {
        let mut search = self.blocks.search(tsids, self.tr, deadline)?;
        let mut found = HashSet::new();
        let mut next_report = PRESENCE_PROGRESS_INTERVAL;

        while search.next_block() {
            found.insert(search.block_header().tsid.metric_id);
            if search.blocks_processed() >= next_report {
                info!(
                    partition = %self.name,
                    blocks = search.blocks_processed(),
                    metric_ids = found.len(),
                    "scanning blocks"
                );
                next_report += PRESENCE_PROGRESS_INTERVAL;
            }
        }
        if let Some(e) = search.take_error() {
            return Err(e);
        }
        Ok(found)
    }

    /// For each metric ID, the days (at most 180, ending with the last
    /// day of the partition) on which it has per-day index items.
    pub fn search_days_for_metric_ids(
        &self,
        tenant: Tenant,
        metric_ids: &[u64],
        deadline: Deadline,
    ) -> Result<Vec<MetricIdDays>, StorageError> {
        let (min_date, max_date) = self.tr.dates();
        let days_back = (max_date - min_date + 1).min(MAX_SEARCH_DAYS);

        let mut out = Vec::with_capacity(metric_ids.len());
        for &metric_id in metric_ids {
            if deadline.exceeded() {
                return Err(StorageError::DeadlineExceeded);
            }
            let days = self
                .idb
                .metric_id_day_range(tenant, metric_id, max_date, days_back)?
                .into_iter()
                .map(keys::format_date)
                .collect();
            out.push(MetricIdDays { metric_id, days });
        }
        Ok(out)
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Marks `metric_ids` deleted. Returns how many were newly marked.
    pub fn delete_metric_ids(&self, metric_ids: &[u64]) -> Result<usize, StorageError> {
        self.idb.delete_metric_ids(metric_ids)
    }

    /// Merges every free index part on its own, dropping items of deleted
    /// metric IDs. A no-op when nothing is marked deleted.
    pub fn force_clean_all_index_parts(&self, stop: &StopSignal) -> Result<ForceMergeStats, StorageError> {
        if self.idb.deleted_metric_ids().is_empty() {
            info!(partition = %self.name, "no deleted metric IDs, skipping forced merge");
            return Ok(ForceMergeStats::default());
        }
        info!(
            partition = %self.name,
            deleted = self.idb.deleted_metric_ids().len(),
            "forced merge of index parts"
        );
        Ok(self.idb.table().force_clean_all_parts(stop)?)
    }

    /// Stores block headers. Every block must lie inside the partition
    /// range.
    pub fn add_blocks(&self, headers: Vec<BlockHeader>) -> Result<(), StorageError> {
        if let Some(h) = headers
            .iter()
            .find(|h| !self.tr.contains(h.min_timestamp) || !self.tr.contains(h.max_timestamp))
        {
            return Err(StorageError::InvalidArgument(format!(
                "block [{}, {}] outside partition {}",
                h.min_timestamp, h.max_timestamp, self.name
            )));
        }
        self.blocks.add_blocks(headers)
    }

    /// Indexes a series seen at `timestamp_ms`, which must lie inside the
    /// partition range.
    pub fn register_series(
        &self,
        tsid: &Tsid,
        name: &MetricName,
        timestamp_ms: i64,
    ) -> Result<(), StorageError> {
        if !self.tr.contains(timestamp_ms) {
            return Err(StorageError::InvalidArgument(format!(
                "timestamp {timestamp_ms} outside partition {}",
                self.name
            )));
        }
        self.idb.register_series(tsid, name, timestamp_ms)
    }

    /// Runs the order validator over every index part. Returns the number
    /// of parts checked.
    pub fn validate_index_parts(&self) -> Result<usize, StorageError> {
        let parts = self.idb.table().get_file_parts()?;
        for pw in &parts {
            validate_order(pw.part())?;
        }
        debug!(partition = %self.name, parts = parts.len(), "index parts validated");
        Ok(parts.len())
    }
}
