//! `indexreaper`: runs one reconciliation sweep over a storage directory
//! and exits.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indexreaper::{Storage, StorageConfig, SweepConfig, Sweeper, TableConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to storage data
    #[arg(long, default_value = "vmstorage-data")]
    storage_data_path: PathBuf,

    /// Tenant in the format <accountID>:<projectID>; repeatable. If empty,
    /// every tenant found in a partition is processed
    #[arg(long = "tenant")]
    tenants: Vec<String>,

    /// Only process series with this metric name
    #[arg(long = "metric")]
    metric_name: Option<String>,

    /// Only process the partition with this name (YYYY_MM)
    #[arg(long = "partition")]
    partition_name: Option<String>,

    /// Upper bound on index part merges running at once
    #[arg(long)]
    max_concurrent_merges: Option<usize>,

    /// Check the order of every index part before sweeping
    #[arg(long)]
    validate: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(args: Args) -> Result<()> {
    let mut table = TableConfig::default();
    if let Some(n) = args.max_concurrent_merges {
        table.max_concurrent_merges = n;
    }

    info!(path = ?args.storage_data_path, "opening storage");
    let storage = Storage::open(
        &args.storage_data_path,
        StorageConfig {
            retention: None,
            table,
        },
    )
    .with_context(|| format!("cannot open storage at {:?}", args.storage_data_path))?;

    let m = storage.metrics()?;
    info!(
        path = ?args.storage_data_path,
        partitions = m.partitions,
        index_parts = m.index_parts,
        blocks = m.blocks,
        rows = m.rows,
        size_bytes = m.index_size_bytes,
        "storage opened"
    );

    let config = SweepConfig {
        metric_name: args.metric_name,
        partition_name: args.partition_name,
        validate_parts: args.validate,
        ..SweepConfig::default()
    }
    .with_tenant_names(&args.tenants)
    .context("invalid --tenant")?;

    let report = Sweeper::new(&storage, config).run().context("sweep failed")?;
    for p in &report.partitions {
        info!(
            partition = %p.name,
            tenants = p.tenants,
            with_data = p.metric_ids_with_data,
            without_data = p.metric_ids_without_data,
            merged_parts = p.pre_merge.merged + p.post_merge.merged,
            skipped_for_space = p.pre_merge.skipped_for_space + p.post_merge.skipped_for_space,
            "partition done"
        );
    }
    if report.total_skipped_for_space() > 0 {
        info!(
            parts = report.total_skipped_for_space(),
            "some parts were not merged for lack of disk space; run again once space is freed"
        );
    }

    storage.close().context("cannot close storage")?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_format);

    if let Err(e) = run(args) {
        error!("indexreaper failed: {e:#}");
        std::process::exit(1);
    }
}
