//! Block-header store and data-presence scan tests.

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, Instant};

    use crate::storage::tests::helpers::{
        DAY_MS, NEXT_PARTITION_START_MS, PARTITION_START_MS, block, day_ts, init_tracing,
        open_partition, tsid,
    };
    use crate::storage::{BlockStore, Deadline, StorageError, Tenant, TimeRange, Tsid};
    use tempfile::TempDir;

    fn month() -> TimeRange {
        TimeRange {
            min_timestamp: PARTITION_START_MS,
            max_timestamp: NEXT_PARTITION_START_MS - 1,
        }
    }

    fn matched(store: &BlockStore, tsids: &[Tsid], range: TimeRange) -> Vec<(u64, i64)> {
        let mut search = store.search(tsids, range, Deadline::none()).unwrap();
        let mut out = Vec::new();
        while search.next_block() {
            let h = search.block_header();
            out.push((h.tsid.metric_id, h.min_timestamp));
        }
        assert!(search.error().is_none());
        out
    }

    /// # Scenario
    /// Blocks for several series written in two files, searched for a
    /// subset of series.
    ///
    /// # Expected behavior
    /// Exactly the blocks of the requested series overlapping the range
    /// are returned, per file in TSID order.
    #[test]
    fn search_matches_requested_series() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = BlockStore::open(tmp.path()).unwrap();
        let tenant = Tenant::new(1, 1);

        store
            .add_blocks(vec![
                block(tsid(tenant, 3), day_ts(1), day_ts(1) + 10),
                block(tsid(tenant, 1), day_ts(0), day_ts(0) + 10),
                block(tsid(tenant, 2), day_ts(2), day_ts(2) + 10),
            ])
            .unwrap();
        store
            .add_blocks(vec![block(tsid(tenant, 3), day_ts(5), day_ts(5) + 10)])
            .unwrap();
        assert_eq!(store.counts().unwrap(), (4, 32));

        let found = matched(&store, &[tsid(tenant, 1), tsid(tenant, 3)], month());
        assert_eq!(
            found,
            vec![(1, day_ts(0)), (3, day_ts(1)), (3, day_ts(5))]
        );

        // Narrow range: only day 5 overlaps.
        let late = TimeRange {
            min_timestamp: day_ts(4),
            max_timestamp: day_ts(6),
        };
        assert_eq!(matched(&store, &[tsid(tenant, 3)], late), vec![(3, day_ts(5))]);
        assert!(matched(&store, &[], month()).is_empty());
    }

    /// # Scenario
    /// A block straddling the range start, and one ending right before it.
    ///
    /// # Expected behavior
    /// The straddling block overlaps; the earlier one does not.
    #[test]
    fn overlap_is_inclusive() {
        let tmp = TempDir::new().unwrap();
        let store = BlockStore::open(tmp.path()).unwrap();
        let t = tsid(Tenant::new(0, 0), 1);
        store
            .add_blocks(vec![
                block(t, PARTITION_START_MS - DAY_MS, PARTITION_START_MS - 1),
                block(t, PARTITION_START_MS - 5, PARTITION_START_MS),
            ])
            .unwrap();
        assert_eq!(
            matched(&store, &[t], month()),
            vec![(1, PARTITION_START_MS - 5)]
        );
    }

    /// # Scenario
    /// Search with TSIDs out of order.
    ///
    /// # Expected behavior
    /// Rejected as malformed input, naming the first unsorted position.
    #[test]
    fn unsorted_tsids_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = BlockStore::open(tmp.path()).unwrap();
        let tenant = Tenant::new(1, 1);
        let err = store
            .search(
                &[tsid(tenant, 1), tsid(tenant, 5), tsid(tenant, 4)],
                month(),
                Deadline::none(),
            )
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::UnsortedTsids { index: 2 }));
        assert!(!err.is_fatal());
    }

    /// # Scenario
    /// Reopen a store holding several files plus a leftover temporary.
    ///
    /// # Expected behavior
    /// Files are found again, the temporary is removed and new files get
    /// fresh names.
    #[test]
    fn reopen_keeps_files() {
        let tmp = TempDir::new().unwrap();
        let t = tsid(Tenant::new(1, 1), 9);
        {
            let store = BlockStore::open(tmp.path()).unwrap();
            store.add_blocks(vec![block(t, day_ts(0), day_ts(0))]).unwrap();
            store.add_blocks(vec![block(t, day_ts(1), day_ts(1))]).unwrap();
        }
        fs::write(tmp.path().join("000009.tmp"), b"junk").unwrap();

        let store = BlockStore::open(tmp.path()).unwrap();
        assert!(!tmp.path().join("000009.tmp").exists());
        assert_eq!(store.counts().unwrap(), (2, 16));
        store.add_blocks(vec![block(t, day_ts(2), day_ts(2))]).unwrap();
        assert!(tmp.path().join("000003.blocks").exists());
        assert_eq!(matched(&store, &[t], month()).len(), 3);
    }

    /// # Scenario
    /// Flip a byte inside the first header chunk of a block file.
    ///
    /// # Expected behavior
    /// The presence scan stops with a fatal checksum error instead of
    /// returning a partial answer.
    #[test]
    fn corrupted_chunk_surfaces_error() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let pt = open_partition(tmp.path());
        let t = tsid(Tenant::new(1, 1), 1);
        pt.add_blocks(vec![block(t, day_ts(0), day_ts(0))]).unwrap();

        drop(pt);

        let file = tmp.path().join("blocks").join("000001.blocks");
        let mut bytes = fs::read(&file).unwrap();
        // File header is 28 bytes, then the chunk length.
        bytes[28 + 4 + 3] ^= 0xFF;
        fs::write(&file, &bytes).unwrap();

        let pt = open_partition(tmp.path());
        let err = pt
            .search_metric_ids_with_data(&[t], Deadline::none())
            .unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
        assert!(err.is_fatal());
    }

    /// # Scenario
    /// Scan more than 1024 headers with a deadline already in the past.
    ///
    /// # Expected behavior
    /// The scan fails with `DeadlineExceeded`.
    #[test]
    fn deadline_stops_scan() {
        let tmp = TempDir::new().unwrap();
        let pt = open_partition(tmp.path());
        let tenant = Tenant::new(1, 1);
        let tsids: Vec<Tsid> = (0..3000).map(|i| tsid(tenant, i)).collect();
        let mut sorted = tsids.clone();
        sorted.sort();
        pt.add_blocks(
            tsids
                .iter()
                .map(|&t| block(t, day_ts(0), day_ts(0)))
                .collect(),
        )
        .unwrap();

        let deadline = Deadline::at(Instant::now());
        std::thread::sleep(Duration::from_millis(2));
        let err = pt.search_metric_ids_with_data(&sorted, deadline).unwrap_err();
        assert!(matches!(err, StorageError::DeadlineExceeded));

        let found = pt
            .search_metric_ids_with_data(&sorted, Deadline::after(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(found.len(), 3000);
    }

    /// # Scenario
    /// A handful of headers scanned with a deadline already in the past.
    ///
    /// # Expected behavior
    /// The first header read trips the deadline.
    #[test]
    fn deadline_checked_on_first_block() {
        let tmp = TempDir::new().unwrap();
        let pt = open_partition(tmp.path());
        let t = tsid(Tenant::new(1, 1), 1);
        pt.add_blocks(vec![block(t, day_ts(0), day_ts(0)), block(t, day_ts(1), day_ts(1))])
            .unwrap();

        let deadline = Deadline::at(Instant::now());
        std::thread::sleep(Duration::from_millis(2));
        let err = pt.search_metric_ids_with_data(&[t], deadline).unwrap_err();
        assert!(matches!(err, StorageError::DeadlineExceeded));
    }
}
