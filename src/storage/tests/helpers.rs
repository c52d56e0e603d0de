use std::path::Path;

use crate::mergeset::TableConfig;
use crate::storage::partition::Partition;
use crate::storage::{BlockHeader, MetricName, Tenant, Tsid};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Partition used by most tests.
pub const PARTITION: &str = "2024_05";

/// 2024-05-01T00:00:00Z.
pub const PARTITION_START_MS: i64 = 1_714_521_600_000;

/// 2024-06-01T00:00:00Z.
pub const NEXT_PARTITION_START_MS: i64 = 1_717_200_000_000;

pub const DAY_MS: i64 = 86_400_000;

/// Timestamp `day` days and one hour into the test partition.
pub fn day_ts(day: i64) -> i64 {
    PARTITION_START_MS + day * DAY_MS + 3_600_000
}

pub fn small_table_config() -> TableConfig {
    TableConfig {
        max_concurrent_merges: 2,
        block_size: 128,
    }
}

pub fn open_partition(dir: &Path) -> Partition {
    Partition::open(dir, PARTITION, &small_table_config()).unwrap()
}

pub fn tsid(tenant: Tenant, metric_id: u64) -> Tsid {
    Tsid {
        account_id: tenant.account_id,
        project_id: tenant.project_id,
        metric_group_id: metric_id % 7,
        job_id: 1,
        instance_id: 2,
        metric_id,
    }
}

pub fn metric_name(name: &str, instance: u64) -> MetricName {
    MetricName::new(name).with_tag("instance", format!("host-{instance}"))
}

pub fn block(tsid: Tsid, min_timestamp: i64, max_timestamp: i64) -> BlockHeader {
    BlockHeader {
        tsid,
        min_timestamp,
        max_timestamp,
        rows_count: 8,
    }
}

/// Registers `ids` as series named `name` of `tenant` seen on `day`.
pub fn register(pt: &Partition, tenant: Tenant, name: &str, ids: &[u64], day: i64) {
    for &id in ids {
        pt.register_series(&tsid(tenant, id), &metric_name(name, id), day_ts(day))
            .unwrap();
    }
}

/// Sorted metric IDs of `tsids`.
pub fn metric_ids(tsids: &[Tsid]) -> Vec<u64> {
    let mut ids: Vec<u64> = tsids.iter().map(|t| t.metric_id).collect();
    ids.sort_unstable();
    ids
}
