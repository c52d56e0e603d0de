//! Deleted-metric-ID set and the merge filter built on it.
//!
//! The set is partition-scoped and grow-only. Readers take an `Arc`
//! snapshot; writers publish a new set copy-on-write, so a merge works
//! against a frozen view for its whole duration and never observes the
//! set shrinking.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use tracing::debug;

use crate::mergeset::{ItemFilter, PreparedFilter, TableError};

use super::keys::{
    COMMON_PREFIX_LEN, NS_DATE_METRIC_NAME_TO_TSID, NS_DATE_TAG_TO_METRIC_IDS,
    NS_DATE_TO_METRIC_ID, NS_DELETED_METRIC_ID, NS_METRIC_ID_TO_METRIC_NAME,
    NS_METRIC_ID_TO_TSID, NS_METRIC_NAME_TO_TSID, NS_TAG_TO_METRIC_IDS, u64_at,
};
use super::metric_name::KV_SEPARATOR;
use super::tsid::{TSID_SIZE, Tsid};

/// Grow-only set of metric IDs marked for removal.
#[derive(Debug, Default)]
pub struct DeletedMetricIds {
    ids: RwLock<Arc<HashSet<u64>>>,
}

impl DeletedMetricIds {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frozen view of the current set.
    pub fn snapshot(&self) -> Arc<HashSet<u64>> {
        // The lock only guards an `Arc` swap, so a poisoned guard still
        // holds a consistent value.
        let guard = self.ids.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Number of deleted IDs.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether nothing is marked.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Whether `metric_id` is marked.
    pub fn contains(&self, metric_id: u64) -> bool {
        self.snapshot().contains(&metric_id)
    }

    /// Adds `ids`, returning how many were not already present.
    pub fn add(&self, ids: impl IntoIterator<Item = u64>) -> usize {
        let mut guard = self.ids.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HashSet::clone(&guard);
        let before = next.len();
        next.extend(ids);
        let added = next.len() - before;
        if added > 0 {
            *guard = Arc::new(next);
        }
        added
    }
}

// ------------------------------------------------------------------------------------------------
// Merge filter
// ------------------------------------------------------------------------------------------------

/// [`ItemFilter`] that drops index items referencing deleted metric IDs.
#[derive(Debug, Clone)]
pub struct DeletedItemsFilter {
    deleted: Arc<DeletedMetricIds>,
}

impl DeletedItemsFilter {
    /// Filter over `deleted`.
    pub fn new(deleted: Arc<DeletedMetricIds>) -> Self {
        Self { deleted }
    }
}

impl ItemFilter for DeletedItemsFilter {
    fn prepare(&self) -> Option<Box<dyn PreparedFilter>> {
        let ids = self.deleted.snapshot();
        if ids.is_empty() {
            debug!("no deleted metric IDs, merge is a pass-through");
            return None;
        }
        Some(Box::new(PreparedDeletedFilter { ids }))
    }
}

struct PreparedDeletedFilter {
    ids: Arc<HashSet<u64>>,
}

impl PreparedDeletedFilter {
    fn metric_id_at(item: &[u8], offset: usize) -> Result<u64, TableError> {
        u64_at(item, offset).ok_or_else(|| {
            TableError::Corruption(format!(
                "namespace {} item of {} bytes has no metric ID at offset {offset}",
                item[0],
                item.len()
            ))
        })
    }

    fn tail_tsid(item: &[u8]) -> Result<Tsid, TableError> {
        let malformed = || {
            TableError::Corruption(format!(
                "namespace {} item of {} bytes has no trailing TSID",
                item[0],
                item.len()
            ))
        };
        if item.len() < COMMON_PREFIX_LEN + 1 + TSID_SIZE {
            return Err(malformed());
        }
        let (head, tail) = item.split_at(item.len() - TSID_SIZE);
        if head.last() != Some(&KV_SEPARATOR) {
            return Err(malformed());
        }
        Tsid::unmarshal_exact(tail).map_err(|e| TableError::Corruption(e.to_string()))
    }
}

impl PreparedFilter for PreparedDeletedFilter {
    fn retain(&self, item: &[u8]) -> Result<bool, TableError> {
        let Some(&ns) = item.first() else {
            return Err(TableError::Corruption("empty index item".into()));
        };
        let metric_id = match ns {
            NS_METRIC_ID_TO_TSID | NS_METRIC_ID_TO_METRIC_NAME => {
                Self::metric_id_at(item, COMMON_PREFIX_LEN)?
            }
            NS_DATE_TO_METRIC_ID => Self::metric_id_at(item, COMMON_PREFIX_LEN + 8)?,
            NS_METRIC_NAME_TO_TSID | NS_DATE_METRIC_NAME_TO_TSID => {
                Self::tail_tsid(item)?.metric_id
            }
            NS_TAG_TO_METRIC_IDS | NS_DATE_TAG_TO_METRIC_IDS | NS_DELETED_METRIC_ID => {
                return Ok(true);
            }
            other => {
                return Err(TableError::Corruption(format!(
                    "unexpected namespace prefix {other}"
                )));
            }
        };
        Ok(!self.ids.contains(&metric_id))
    }
}
