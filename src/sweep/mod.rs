//! # Sweep
//!
//! The reconciliation workflow. For every partition (or only the one
//! named in [`SweepConfig::partition_name`]):
//!
//! 1. Force-merge the index so deletions left by an earlier run are
//!    purged before counting.
//! 2. For every tenant, in ascending order, collect the TSIDs of the index
//!    (all of them, or those named [`SweepConfig::metric_name`]), sort
//!    them and ask the block store which of their metric IDs own data in
//!    the partition range.
//! 3. Mark the difference deleted.
//! 4. Force-merge again so the marked IDs are physically removed.
//!
//! Partitions and tenants are processed sequentially. The only fan-out is
//! inside the forced merge. Any error stops the sweep; space shortfalls
//! are not errors and show up in the merge statistics instead.

#[cfg(test)]
mod tests;

use std::{collections::HashSet, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mergeset::ForceMergeStats;
use crate::storage::{
    Deadline, ParseTenantError, Partition, StopSignal, Storage, StorageError, Tenant,
};

/// Default number of tenants between two progress lines.
pub const DEFAULT_PROGRESS_EVERY: usize = 10_000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that abort a sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    /// A tenant string is not `<accountID>:<projectID>`.
    #[error(transparent)]
    InvalidTenant(#[from] ParseTenantError),

    /// Storage, index or block-store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl SweepError {
    /// Whether the on-disk state may be corrupted.
    pub fn is_fatal(&self) -> bool {
        match self {
            SweepError::Storage(e) => e.is_fatal(),
            SweepError::InvalidTenant(_) | SweepError::InvalidConfig(_) => false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// What to sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Tenants to process. Empty means every tenant found in a partition.
    pub tenants: Vec<Tenant>,

    /// Only consider series with this metric name.
    pub metric_name: Option<String>,

    /// Only process the partition with this name.
    pub partition_name: Option<String>,

    /// Tenants between two progress lines.
    pub progress_every: usize,

    /// Run the order validator over every index part before sweeping a
    /// partition.
    pub validate_parts: bool,

    /// Timeout of each index and block query.
    pub query_timeout: Option<Duration>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            tenants: Vec::new(),
            metric_name: None,
            partition_name: None,
            progress_every: DEFAULT_PROGRESS_EVERY,
            validate_parts: false,
            query_timeout: None,
        }
    }
}

impl SweepConfig {
    /// Replaces the tenant allow-list with `names` parsed as
    /// `<accountID>:<projectID>`.
    pub fn with_tenant_names<I, S>(mut self, names: I) -> Result<Self, SweepError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tenants = names
            .into_iter()
            .map(|s| s.as_ref().parse::<Tenant>())
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    /// Checks parameter ranges.
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.progress_every < 1 {
            return Err(SweepError::InvalidConfig(
                "progress_every must be >= 1".into(),
            ));
        }
        if self.metric_name.as_deref() == Some("") {
            return Err(SweepError::InvalidConfig(
                "metric_name must not be empty when set".into(),
            ));
        }
        Ok(())
    }

    fn deadline(&self) -> Deadline {
        self.query_timeout.map_or_else(Deadline::none, Deadline::after)
    }
}

// ------------------------------------------------------------------------------------------------
// Reports
// ------------------------------------------------------------------------------------------------

/// Outcome of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionReport {
    /// Partition name.
    pub name: String,
    /// Tenants processed.
    pub tenants: usize,
    /// Metric IDs with at least one block in range.
    pub metric_ids_with_data: usize,
    /// Metric IDs without data, all marked deleted.
    pub metric_ids_without_data: usize,
    /// Of those, how many were not already marked.
    pub newly_deleted: usize,
    /// Index parts checked by the order validator.
    pub parts_validated: usize,
    /// Forced merge before the tenant loop.
    pub pre_merge: ForceMergeStats,
    /// Forced merge after the tenant loop.
    pub post_merge: ForceMergeStats,
}

/// Outcome of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Processed partitions, in name order.
    pub partitions: Vec<PartitionReport>,
    /// Partitions skipped by the name filter.
    pub skipped_partitions: Vec<String>,
    /// The stop signal cut the sweep short.
    pub stopped: bool,
}

impl SweepReport {
    /// Metric IDs without data across partitions.
    pub fn total_without_data(&self) -> usize {
        self.partitions.iter().map(|p| p.metric_ids_without_data).sum()
    }

    /// Metric IDs with data across partitions.
    pub fn total_with_data(&self) -> usize {
        self.partitions.iter().map(|p| p.metric_ids_with_data).sum()
    }

    /// Parts left unmerged for lack of disk space.
    pub fn total_skipped_for_space(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.pre_merge.skipped_for_space + p.post_merge.skipped_for_space)
            .sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Sweeper
// ------------------------------------------------------------------------------------------------

/// Runs the reconciliation workflow over a [`Storage`].
pub struct Sweeper<'a> {
    storage: &'a Storage,
    config: SweepConfig,
    stop: StopSignal,
}

impl<'a> Sweeper<'a> {
    /// Sweeper over `storage`.
    pub fn new(storage: &'a Storage, config: SweepConfig) -> Self {
        Self {
            storage,
            config,
            stop: StopSignal::new(),
        }
    }

    /// Uses `stop` to cut the sweep short: no new merge is admitted and no
    /// further tenant or partition is started once it is raised.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Runs one sweep to completion.
    pub fn run(&self) -> Result<SweepReport, SweepError> {
        self.config.validate()?;
        let partitions = self.storage.get_partitions()?;
        let result = self.sweep_partitions(&partitions);
        self.storage.put_partitions(partitions);
        result
    }

    fn sweep_partitions(&self, partitions: &[Arc<Partition>]) -> Result<SweepReport, SweepError> {
        let mut report = SweepReport::default();
        for pt in partitions {
            if self
                .config
                .partition_name
                .as_deref()
                .is_some_and(|name| name != pt.name())
            {
                info!(partition = %pt.name(), "skipping partition");
                report.skipped_partitions.push(pt.name().to_string());
                continue;
            }
            if self.stop.is_raised() {
                report.stopped = true;
                break;
            }
            report.partitions.push(self.sweep_partition(pt)?);
        }

        if let Some(name) = &self.config.partition_name {
            if !report.stopped && report.partitions.iter().all(|p| &p.name != name) {
                warn!(partition = %name, "partition not found");
            }
        }
        report.stopped |= self.stop.is_raised();
        Ok(report)
    }

    fn sweep_partition(&self, pt: &Partition) -> Result<PartitionReport, SweepError> {
        info!(partition = %pt.name(), "processing partition");
        let mut report = PartitionReport {
            name: pt.name().to_string(),
            ..PartitionReport::default()
        };

        if self.config.validate_parts {
            report.parts_validated = pt.validate_index_parts()?;
            info!(partition = %pt.name(), parts = report.parts_validated, "index parts validated");
        }

        report.pre_merge = pt.force_clean_all_index_parts(&self.stop)?;

        let tenants = if self.config.tenants.is_empty() {
            pt.search_tenants(self.config.deadline())?
        } else {
            let mut tenants = self.config.tenants.clone();
            tenants.sort_unstable();
            tenants.dedup();
            tenants
        };
        info!(partition = %pt.name(), tenants = tenants.len(), "found tenants");

        let mut orphans = Vec::new();
        let swept = self.sweep_tenants(pt, &tenants, &mut report, &mut orphans);
        // Markers of every tenant land in one part; persist what was found
        // even when the tenant loop failed.
        let marked = pt.delete_metric_ids(&orphans);
        swept?;
        report.newly_deleted = marked?;
        info!(
            partition = %pt.name(),
            with_data = report.metric_ids_with_data,
            without_data = report.metric_ids_without_data,
            newly_deleted = report.newly_deleted,
            "partition reconciled"
        );

        report.post_merge = pt.force_clean_all_index_parts(&self.stop)?;
        Ok(report)
    }

    fn sweep_tenants(
        &self,
        pt: &Partition,
        tenants: &[Tenant],
        report: &mut PartitionReport,
        orphans: &mut Vec<u64>,
    ) -> Result<(), SweepError> {
        for (i, &tenant) in tenants.iter().enumerate() {
            if self.stop.is_raised() {
                warn!(partition = %pt.name(), processed = i, "stop requested, leaving tenant loop");
                break;
            }
            if i % self.config.progress_every == 0 {
                info!(
                    partition = %pt.name(),
                    processed = i,
                    total = tenants.len(),
                    tenant = %tenant,
                    "processing tenants"
                );
            }
            let (with_data, without_data) = self.sweep_tenant(pt, tenant, orphans)?;
            report.tenants += 1;
            report.metric_ids_with_data += with_data;
            report.metric_ids_without_data += without_data;
        }
        Ok(())
    }

    /// Appends the tenant's metric IDs without data to `orphans`. Returns
    /// `(with_data, without_data)` counts.
    fn sweep_tenant(
        &self,
        pt: &Partition,
        tenant: Tenant,
        orphans: &mut Vec<u64>,
    ) -> Result<(usize, usize), SweepError> {
        let deadline = self.config.deadline();
        let mut tsids = match &self.config.metric_name {
            None => pt.search_tsid(tenant, deadline)?,
            Some(name) => pt.search_tsid_by_name(tenant, name.as_bytes(), deadline)?,
        };
        let metric_ids: HashSet<u64> = tsids.iter().map(|t| t.metric_id).collect();
        debug!(tenant = %tenant, tsids = tsids.len(), metric_ids = metric_ids.len(), "tenant TSIDs loaded");

        tsids.sort_unstable();
        tsids.dedup();
        let with_data = pt.search_metric_ids_with_data(&tsids, self.config.deadline())?;

        let before = orphans.len();
        orphans.extend(metric_ids.iter().copied().filter(|id| !with_data.contains(id)));
        let without_data = orphans.len() - before;

        info!(
            partition = %pt.name(),
            tenant = %tenant,
            with_data = with_data.len(),
            without_data,
            "tenant reconciled"
        );
        Ok((with_data.len(), without_data))
    }
}
