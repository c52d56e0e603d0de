//! Index reader and writer of one partition.
//!
//! [`IndexDb`] owns the partition's mergeset [`Table`] and its
//! [`DeletedMetricIds`] set. The set is rebuilt from the persisted
//! deleted-metric-ID items on open and installed as the table's merge
//! filter, so forced merges purge exactly what has been marked.
//!
//! Reads go through a merged cursor over every live part. Items of
//! deleted metric IDs may still be present until the next merge; the
//! tag-index lookups drop them, `get_tsids` does not.

use std::{
    collections::{BTreeSet, HashSet},
    path::Path,
    sync::Arc,
};

use tracing::{debug, info, trace};

use crate::mergeset::{MergeIter, Table, TableConfig};
use crate::part::Part;

use super::deleted::{DeletedItemsFilter, DeletedMetricIds};
use super::keys::{
    self, COMMON_PREFIX_LEN, NS_DATE_TO_METRIC_ID, NS_DELETED_METRIC_ID, u64_at,
};
use super::metric_name::{MetricName, Tag, TagFilter};
use super::tsid::{Tenant, Tsid};
use super::{Deadline, StorageError, TimeRange};

/// Index of one partition.
#[derive(Debug)]
pub struct IndexDb {
    table: Table,
    deleted: Arc<DeletedMetricIds>,
}

impl IndexDb {
    /// Opens (or creates) the index stored in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: &TableConfig) -> Result<Self, StorageError> {
        let deleted = Arc::new(DeletedMetricIds::new());
        let table = Table::open(dir, config.clone())?
            .with_filter(Arc::new(DeletedItemsFilter::new(Arc::clone(&deleted))));
        let idb = Self { table, deleted };
        idb.load_deleted_metric_ids()?;
        Ok(idb)
    }

    /// The underlying table.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// The deleted-metric-ID set consulted by merges.
    pub fn deleted_metric_ids(&self) -> &Arc<DeletedMetricIds> {
        &self.deleted
    }

    fn load_deleted_metric_ids(&self) -> Result<(), StorageError> {
        let prefix = [NS_DELETED_METRIC_ID];
        let mut ids = Vec::new();
        self.scan_prefix(&prefix, Deadline::none(), |item| {
            let id = u64_at(item, 1).ok_or_else(|| {
                StorageError::Corruption(format!(
                    "deleted metric ID item of {} bytes",
                    item.len()
                ))
            })?;
            ids.push(id);
            Ok(true)
        })?;
        let loaded = self.deleted.add(ids);
        if loaded > 0 {
            info!(path = ?self.table.path(), deleted = loaded, "deleted metric IDs loaded");
        }
        Ok(())
    }

    fn search(&self) -> Result<MergeIter<Arc<Part>>, StorageError> {
        Ok(self.table.search()?)
    }

    /// Calls `f` for every item starting with `prefix` until it returns
    /// `Ok(false)`.
    fn scan_prefix<F>(&self, prefix: &[u8], deadline: Deadline, mut f: F) -> Result<(), StorageError>
    where
        F: FnMut(&[u8]) -> Result<bool, StorageError>,
    {
        let mut it = self.search()?;
        it.seek(prefix);
        let mut loops = 0u64;
        while it.next_item() {
            deadline.check(loops)?;
            loops += 1;
            let item = it.item();
            if !item.starts_with(prefix) {
                break;
            }
            if !f(item)? {
                break;
            }
        }
        if let Some(e) = it.take_error() {
            return Err(e.into());
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Tenants
    // --------------------------------------------------------------------------------------------

    /// Tenants with at least one per-day metric ID item on a day of `tr`,
    /// in ascending order.
    pub fn search_tenants(&self, tr: TimeRange, deadline: Deadline) -> Result<Vec<Tenant>, StorageError> {
        let (min_date, max_date) = tr.dates();
        let mut tenants = BTreeSet::new();
        let mut it = self.search()?;
        it.seek(&[NS_DATE_TO_METRIC_ID]);

        let mut loops = 0u64;
        while it.next_item() {
            deadline.check(loops)?;
            loops += 1;

            let item = it.item();
            if item.first() != Some(&NS_DATE_TO_METRIC_ID) {
                break;
            }
            let (Some(tenant), Some(date)) = (keys::tenant_of(item), u64_at(item, COMMON_PREFIX_LEN))
            else {
                return Err(StorageError::Corruption(format!(
                    "date to metric ID item of {} bytes",
                    item.len()
                )));
            };

            if date < min_date {
                it.seek(&keys::date_prefix(NS_DATE_TO_METRIC_ID, tenant, min_date));
                continue;
            }
            if date <= max_date {
                tenants.insert(tenant);
            }
            // Skip the rest of this tenant.
            match tenant.next() {
                Some(next) => it.seek(&keys::common_prefix(NS_DATE_TO_METRIC_ID, next)),
                None => break,
            }
        }
        if let Some(e) = it.take_error() {
            return Err(e.into());
        }

        debug!(path = ?self.table.path(), tenants = tenants.len(), "tenants found");
        Ok(tenants.into_iter().collect())
    }

    // --------------------------------------------------------------------------------------------
    // TSIDs
    // --------------------------------------------------------------------------------------------

    /// Every TSID of `tenant`, in index order.
    pub fn get_tsids(&self, tenant: Tenant, deadline: Deadline) -> Result<Vec<Tsid>, StorageError> {
        let prefix = keys::common_prefix(keys::NS_METRIC_ID_TO_TSID, tenant);
        let mut tsids = Vec::new();
        self.scan_prefix(&prefix, deadline, |item| {
            let tail = item.get(COMMON_PREFIX_LEN + 8..).ok_or_else(|| {
                StorageError::Corruption(format!("metric ID to TSID item of {} bytes", item.len()))
            })?;
            tsids.push(Tsid::unmarshal_exact(tail)?);
            Ok(true)
        })?;
        trace!(tenant = %tenant, tsids = tsids.len(), "TSIDs read");
        Ok(tsids)
    }

    /// TSIDs of `tenant` whose metric name equals `name`. Deleted metric
    /// IDs are excluded.
    pub fn get_tsids_by_name(
        &self,
        tenant: Tenant,
        name: &[u8],
        deadline: Deadline,
    ) -> Result<Vec<Tsid>, StorageError> {
        let ids = self.search_metric_ids(tenant, &[TagFilter::metric_name(name)], deadline)?;
        self.get_tsids_from_metric_ids(tenant, ids, deadline)
    }

    /// Resolves metric IDs to TSIDs. IDs without a TSID item are skipped.
    pub fn get_tsids_from_metric_ids(
        &self,
        tenant: Tenant,
        metric_ids: impl IntoIterator<Item = u64>,
        deadline: Deadline,
    ) -> Result<Vec<Tsid>, StorageError> {
        let mut ids: Vec<u64> = metric_ids.into_iter().collect();
        ids.sort_unstable();

        let mut it = self.search()?;
        let mut tsids = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            deadline.check(i as u64)?;
            let prefix = keys::metric_id_to_tsid_prefix(tenant, id);
            it.seek(&prefix);
            if it.next_item() && it.item().starts_with(&prefix) {
                tsids.push(Tsid::unmarshal_exact(&it.item()[prefix.len()..])?);
            } else if let Some(e) = it.take_error() {
                return Err(e.into());
            } else {
                debug!(tenant = %tenant, metric_id = id, "metric ID has no TSID");
            }
        }
        Ok(tsids)
    }

    /// Metric IDs of `tenant` matching every filter. Deleted metric IDs
    /// are excluded.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidArgument`] for an empty filter list.
    pub fn search_metric_ids(
        &self,
        tenant: Tenant,
        filters: &[TagFilter],
        deadline: Deadline,
    ) -> Result<HashSet<u64>, StorageError> {
        if filters.is_empty() {
            return Err(StorageError::InvalidArgument("no tag filters".into()));
        }

        let mut result: Option<HashSet<u64>> = None;
        for filter in filters {
            let tag = Tag::new(filter.key.clone(), filter.value.clone());
            let prefix = keys::tag_to_metric_ids_prefix(tenant, &tag);
            let mut ids = HashSet::new();
            self.scan_prefix(&prefix, deadline, |item| {
                let tail = &item[prefix.len()..];
                if tail.is_empty() || tail.len() % 8 != 0 {
                    return Err(StorageError::Corruption(format!(
                        "tag to metric IDs item with a {}-byte tail",
                        tail.len()
                    )));
                }
                for chunk in tail.chunks_exact(8) {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(chunk);
                    ids.insert(u64::from_be_bytes(b));
                }
                Ok(true)
            })?;

            result = Some(match result {
                None => ids,
                Some(acc) => acc.intersection(&ids).copied().collect(),
            });
            if result.as_ref().is_some_and(HashSet::is_empty) {
                break;
            }
        }

        let deleted = self.deleted.snapshot();
        let mut ids = result.unwrap_or_default();
        if !deleted.is_empty() {
            ids.retain(|id| !deleted.contains(id));
        }
        Ok(ids)
    }

    /// Metric name stored for `metric_id`.
    pub fn search_metric_name(
        &self,
        tenant: Tenant,
        metric_id: u64,
    ) -> Result<Option<MetricName>, StorageError> {
        let prefix = keys::metric_id_to_metric_name_prefix(tenant, metric_id);
        let mut it = self.search()?;
        it.seek(&prefix);
        if it.next_item() && it.item().starts_with(&prefix) {
            return Ok(Some(MetricName::unmarshal(&it.item()[prefix.len()..])?));
        }
        match it.take_error() {
            Some(e) => Err(e.into()),
            None => Ok(None),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Per-day presence
    // --------------------------------------------------------------------------------------------

    /// Whether `metric_id` has a per-day item on `date`.
    pub fn has_date_metric_id(
        &self,
        tenant: Tenant,
        date: u64,
        metric_id: u64,
    ) -> Result<bool, StorageError> {
        let key = keys::date_to_metric_id(tenant, date, metric_id);
        let mut it = self.search()?;
        it.seek(&key);
        if it.next_item() {
            return Ok(it.item() == key.as_slice());
        }
        match it.take_error() {
            Some(e) => Err(e.into()),
            None => Ok(false),
        }
    }

    /// Days in `(last_date - days_back, last_date]` on which `metric_id`
    /// has a per-day item, most recent first.
    pub fn metric_id_day_range(
        &self,
        tenant: Tenant,
        metric_id: u64,
        last_date: u64,
        days_back: u64,
    ) -> Result<Vec<u64>, StorageError> {
        if days_back == 0 {
            return Ok(Vec::new());
        }
        let first = last_date.saturating_sub(days_back - 1);
        let mut days = Vec::new();
        for date in (first..=last_date).rev() {
            if self.has_date_metric_id(tenant, date, metric_id)? {
                days.push(date);
            }
        }
        Ok(days)
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Writes every index item of a series seen at `timestamp_ms`.
    pub fn register_series(
        &self,
        tsid: &Tsid,
        name: &MetricName,
        timestamp_ms: i64,
    ) -> Result<(), StorageError> {
        self.register_series_batch(std::iter::once((tsid, name, timestamp_ms)))
    }

    /// Writes the index items of many series as one part.
    pub fn register_series_batch<'a, I>(&self, series: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = (&'a Tsid, &'a MetricName, i64)>,
    {
        let items: Vec<Vec<u8>> = series
            .into_iter()
            .flat_map(|(tsid, name, ts)| keys::series_items(tsid, name, keys::date_of(ts)))
            .collect();
        self.table.add_items(items)?;
        Ok(())
    }

    /// Marks `metric_ids` deleted: persists a marker item per new ID, then
    /// publishes them to the set read by merges. Returns how many IDs were
    /// newly marked.
    pub fn delete_metric_ids(&self, metric_ids: &[u64]) -> Result<usize, StorageError> {
        let current = self.deleted.snapshot();
        let fresh: Vec<u64> = metric_ids
            .iter()
            .copied()
            .filter(|id| !current.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        self.table
            .add_items(fresh.iter().map(|&id| keys::deleted_metric_id(id)))?;
        let added = self.deleted.add(fresh);
        debug!(path = ?self.table.path(), added, "metric IDs marked deleted");
        Ok(added)
    }
}
