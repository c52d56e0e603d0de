//! Reconciliation workflow tests.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::mergeset::TableConfig;
    use crate::storage::{
        BlockHeader, Deadline, MetricName, Partition, StopSignal, Storage, StorageConfig, Tenant,
        Tsid,
    };
    use crate::sweep::{SweepConfig, SweepError, Sweeper};
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    /// 2024-05-01T00:00:00Z.
    const MAY_START_MS: i64 = 1_714_521_600_000;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn open_storage(tmp: &TempDir) -> Storage {
        Storage::open(
            tmp.path(),
            StorageConfig {
                retention: None,
                table: TableConfig {
                    max_concurrent_merges: 2,
                    block_size: 256,
                },
            },
        )
        .unwrap()
    }

    fn tsid(tenant: Tenant, metric_id: u64) -> Tsid {
        Tsid {
            account_id: tenant.account_id,
            project_id: tenant.project_id,
            metric_group_id: 100 - metric_id,
            job_id: 0,
            instance_id: 0,
            metric_id,
        }
    }

    /// Indexes series `ids` named `name`; those in `with_data` also get a
    /// block.
    fn seed(pt: &Partition, tenant: Tenant, name: &str, ids: &[u64], with_data: &[u64]) {
        let ts = pt.time_range().min_timestamp + 1_000;
        for &id in ids {
            let metric = MetricName::new(name).with_tag("id", id.to_string());
            pt.register_series(&tsid(tenant, id), &metric, ts).unwrap();
        }
        pt.add_blocks(
            with_data
                .iter()
                .map(|&id| BlockHeader {
                    tsid: tsid(tenant, id),
                    min_timestamp: ts,
                    max_timestamp: ts + 60_000,
                    rows_count: 4,
                })
                .collect(),
        )
        .unwrap();
    }

    fn live_ids(pt: &Partition, tenant: Tenant) -> HashSet<u64> {
        pt.search_tsid(tenant, Deadline::none())
            .unwrap()
            .iter()
            .map(|t| t.metric_id)
            .collect()
    }

    /// # Scenario
    /// Series 1, 2 and 3 indexed; only series 2 has a block.
    ///
    /// # Expected behavior
    /// 1 and 3 are found without data, marked deleted and purged by the
    /// closing merge; 2 remains.
    #[test]
    fn orphans_are_purged() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let storage = open_storage(&tmp);
        let pt = storage.create_partition("2024_05").unwrap();
        let tenant = Tenant::new(1, 1);
        seed(&pt, tenant, "up", &[1, 2, 3], &[2]);

        let report = Sweeper::new(&storage, SweepConfig::default()).run().unwrap();

        assert_eq!(report.partitions.len(), 1);
        let p = &report.partitions[0];
        assert_eq!(p.tenants, 1);
        assert_eq!(p.metric_ids_with_data, 1);
        assert_eq!(p.metric_ids_without_data, 2);
        assert_eq!(p.newly_deleted, 2);
        assert_eq!(p.pre_merge.merged, 0);
        assert!(p.post_merge.merged > 0);
        assert!(p.post_merge.items_dropped > 0);

        assert_eq!(live_ids(&pt, tenant), HashSet::from([2]));
        let idb = pt.index_db();
        assert!(idb.search_metric_name(tenant, 1).unwrap().is_none());
        assert!(idb.search_metric_name(tenant, 3).unwrap().is_none());
        assert!(idb.search_metric_name(tenant, 2).unwrap().is_some());
        assert_eq!(storage.metrics().unwrap().partitions_in_use, 0);
    }

    /// Index parts made only of deletion markers.
    fn marker_parts(pt: &Partition) -> usize {
        pt.index_db()
            .table()
            .get_file_parts()
            .unwrap()
            .iter()
            .filter(|pw| {
                let meta = pw.part().metadata();
                meta.first_item[0] == 4 && meta.last_item[0] == 4
            })
            .count()
    }

    /// # Scenario
    /// 20 tenants each own an orphan and a series with data. After the
    /// first sweep, 20 more tenants with orphans arrive and a second sweep
    /// runs.
    ///
    /// # Expected behavior
    /// Each sweep writes the markers of all its tenants into a single
    /// part, so the index holds two marker parts and every orphan is gone.
    #[test]
    fn markers_of_all_tenants_share_one_part() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let storage = open_storage(&tmp);
        let pt = storage.create_partition("2024_05").unwrap();
        for account in 0..20 {
            seed(&pt, Tenant::new(account, 0), "up", &[1, 2], &[2]);
        }

        let report = Sweeper::new(&storage, SweepConfig::default()).run().unwrap();
        assert_eq!(report.partitions[0].tenants, 20);
        assert_eq!(report.partitions[0].newly_deleted, 1);
        assert_eq!(marker_parts(&pt), 1);
        assert_eq!(pt.index_db().table().metrics().unwrap().parts_count, 21);

        for account in 20..40 {
            seed(&pt, Tenant::new(account, 0), "up", &[3 + account as u64], &[]);
        }
        let report = Sweeper::new(&storage, SweepConfig::default()).run().unwrap();
        assert_eq!(report.partitions[0].tenants, 40);
        assert_eq!(report.partitions[0].newly_deleted, 20);
        assert_eq!(marker_parts(&pt), 2);
        assert_eq!(pt.index_db().table().metrics().unwrap().parts_count, 22);

        for account in 0..20 {
            assert_eq!(live_ids(&pt, Tenant::new(account, 0)), HashSet::from([2]));
        }
        for account in 20..40 {
            assert!(live_ids(&pt, Tenant::new(account, 0)).is_empty());
        }
    }

    /// # Scenario
    /// Sweep twice without adding anything in between.
    ///
    /// # Expected behavior
    /// The second run finds nothing new and its merges drop nothing.
    #[test]
    fn second_sweep_is_a_fixed_point() {
        let tmp = TempDir::new().unwrap();
        let storage = open_storage(&tmp);
        let pt = storage.create_partition("2024_05").unwrap();
        let tenant = Tenant::new(0, 7);
        seed(&pt, tenant, "up", &[1, 2, 3, 4], &[1, 4]);

        Sweeper::new(&storage, SweepConfig::default()).run().unwrap();
        let items = pt.index_db().table().metrics().unwrap().items_count;

        let report = Sweeper::new(&storage, SweepConfig::default()).run().unwrap();
        let p = &report.partitions[0];
        assert_eq!(p.metric_ids_without_data, 0);
        assert_eq!(p.newly_deleted, 0);
        assert_eq!(p.pre_merge.items_dropped + p.post_merge.items_dropped, 0);
        assert_eq!(pt.index_db().table().metrics().unwrap().items_count, items);
        assert_eq!(live_ids(&pt, tenant), HashSet::from([1, 4]));
    }

    /// # Scenario
    /// Two tenants and two metric names; the sweep is limited to one
    /// tenant and one name.
    ///
    /// # Expected behavior
    /// Only orphans of that name in that tenant are removed.
    #[test]
    fn tenant_and_name_filters() {
        let tmp = TempDir::new().unwrap();
        let storage = open_storage(&tmp);
        let pt = storage.create_partition("2024_05").unwrap();
        let a = Tenant::new(1, 1);
        let b = Tenant::new(2, 2);
        seed(&pt, a, "cpu", &[1, 2], &[]);
        seed(&pt, a, "mem", &[3], &[]);
        seed(&pt, b, "cpu", &[4], &[]);

        let config = SweepConfig {
            metric_name: Some("cpu".into()),
            ..SweepConfig::default()
        }
        .with_tenant_names(["1:1"])
        .unwrap();
        let report = Sweeper::new(&storage, config).run().unwrap();

        assert_eq!(report.partitions[0].tenants, 1);
        assert_eq!(report.partitions[0].metric_ids_without_data, 2);
        assert_eq!(live_ids(&pt, a), HashSet::from([3]));
        assert_eq!(live_ids(&pt, b), HashSet::from([4]));
    }

    /// # Scenario
    /// Two partitions, the sweep limited to one of them by name.
    ///
    /// # Expected behavior
    /// The other partition is reported as skipped and left untouched.
    #[test]
    fn partition_filter() {
        let tmp = TempDir::new().unwrap();
        let storage = open_storage(&tmp);
        let may = storage.create_partition("2024_05").unwrap();
        let june = storage.partition_for_timestamp(MAY_START_MS + 40 * 86_400_000).unwrap();
        let tenant = Tenant::new(1, 1);
        seed(&may, tenant, "up", &[1], &[]);
        seed(&june, tenant, "up", &[2], &[]);

        let config = SweepConfig {
            partition_name: Some("2024_06".into()),
            ..SweepConfig::default()
        };
        let report = Sweeper::new(&storage, config).run().unwrap();

        assert_eq!(report.skipped_partitions, vec!["2024_05".to_string()]);
        assert_eq!(report.partitions.len(), 1);
        assert_eq!(report.partitions[0].name, "2024_06");
        assert_eq!(live_ids(&may, tenant), HashSet::from([1]));
        assert!(live_ids(&june, tenant).is_empty());
    }

    /// # Scenario
    /// Malformed tenant names and configuration.
    ///
    /// # Expected behavior
    /// Rejected before anything is touched; not fatal.
    #[test]
    fn invalid_config_rejected() {
        let err = SweepConfig::default()
            .with_tenant_names(["1:1", "abc"])
            .unwrap_err();
        assert!(matches!(err, SweepError::InvalidTenant(_)));
        assert!(!err.is_fatal());

        let tmp = TempDir::new().unwrap();
        let storage = open_storage(&tmp);
        let config = SweepConfig {
            progress_every: 0,
            ..SweepConfig::default()
        };
        let err = Sweeper::new(&storage, config).run().unwrap_err();
        assert!(matches!(err, SweepError::InvalidConfig(_)));
    }

    /// # Scenario
    /// Sweep with the stop signal already raised.
    ///
    /// # Expected behavior
    /// Nothing is processed, the report says so and partitions are
    /// returned.
    #[test]
    fn raised_stop_signal_skips_work() {
        let tmp = TempDir::new().unwrap();
        let storage = open_storage(&tmp);
        let pt = storage.create_partition("2024_05").unwrap();
        let tenant = Tenant::new(1, 1);
        seed(&pt, tenant, "up", &[1, 2], &[]);

        let stop = StopSignal::new();
        stop.raise();
        let report = Sweeper::new(&storage, SweepConfig::default())
            .with_stop_signal(stop)
            .run()
            .unwrap();

        assert!(report.stopped);
        assert!(report.partitions.is_empty());
        assert_eq!(live_ids(&pt, tenant), HashSet::from([1, 2]));
        assert_eq!(storage.metrics().unwrap().partitions_in_use, 0);
    }

    /// # Scenario
    /// Sweep with part validation enabled.
    ///
    /// # Expected behavior
    /// Every index part is checked and the sweep proceeds.
    #[test]
    fn validation_before_sweep() {
        let tmp = TempDir::new().unwrap();
        let storage = open_storage(&tmp);
        let pt = storage.create_partition("2024_05").unwrap();
        seed(&pt, Tenant::new(1, 1), "up", &[1, 2, 3], &[1, 2, 3]);

        let config = SweepConfig {
            validate_parts: true,
            ..SweepConfig::default()
        };
        let report = Sweeper::new(&storage, config).run().unwrap();
        assert_eq!(report.partitions[0].parts_validated, 3);
        assert_eq!(report.total_without_data(), 0);
        assert_eq!(report.total_with_data(), 3);
    }
}
