use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::mergeset::{
    FreeSpaceProbe, ItemFilter, PreparedFilter, Table, TableConfig, TableError,
};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn small_config(max_concurrent_merges: usize) -> TableConfig {
    TableConfig {
        max_concurrent_merges,
        block_size: 128,
    }
}

/// All items visible through a table-wide merged search.
pub fn collect_items(table: &Table) -> Vec<Vec<u8>> {
    let mut iter = table.search().unwrap();
    iter.seek(&[]);
    let mut out = Vec::new();
    while iter.next_item() {
        out.push(iter.item().to_vec());
    }
    assert!(iter.error().is_none());
    out
}

/// Probe reporting a settable number of free bytes.
#[derive(Default)]
pub struct FixedProbe(pub AtomicU64);

impl FixedProbe {
    pub fn new(bytes: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(bytes)))
    }
}

impl FreeSpaceProbe for FixedProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0.load(Ordering::Acquire))
    }
}

/// Probe that always fails.
pub struct BrokenProbe;

impl FreeSpaceProbe for BrokenProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::other("statvfs unavailable"))
    }
}

/// Drops exactly the listed items; items starting with `0xFF` are
/// reported as corrupted. An empty set prepares no filter.
#[derive(Default)]
pub struct SetFilter {
    pub dropped: std::sync::RwLock<Arc<HashSet<Vec<u8>>>>,
    pub delay: Option<Duration>,
}

impl SetFilter {
    pub fn new(items: impl IntoIterator<Item = Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            dropped: std::sync::RwLock::new(Arc::new(items.into_iter().collect())),
            delay: None,
        })
    }

    pub fn slow(items: impl IntoIterator<Item = Vec<u8>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            dropped: std::sync::RwLock::new(Arc::new(items.into_iter().collect())),
            delay: Some(delay),
        })
    }
}

struct PreparedSet {
    dropped: Arc<HashSet<Vec<u8>>>,
    delay: Option<Duration>,
}

impl ItemFilter for SetFilter {
    fn prepare(&self) -> Option<Box<dyn PreparedFilter>> {
        let dropped = Arc::clone(&self.dropped.read().unwrap());
        if dropped.is_empty() {
            return None;
        }
        Some(Box::new(PreparedSet {
            dropped,
            delay: self.delay,
        }))
    }
}

impl PreparedFilter for PreparedSet {
    fn retain(&self, item: &[u8]) -> Result<bool, TableError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if item.first() == Some(&0xFF) {
            return Err(TableError::Corruption(format!("bad item {item:?}")));
        }
        Ok(!self.dropped.contains(item))
    }
}
