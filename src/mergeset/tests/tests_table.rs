//! Table open / add / search / claim tests.

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::mergeset::tests::helpers::{collect_items, init_tracing, small_config};
    use crate::mergeset::{PartState, Table, TableConfig, TableError};
    use tempfile::TempDir;

    fn bytes(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    /// # Scenario
    /// Two batches with an overlapping item.
    ///
    /// # Expected behavior
    /// Two parts; the merged search yields the sorted union once.
    #[test]
    fn add_items_and_search_across_parts() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let table = Table::open(tmp.path(), small_config(2)).unwrap();

        table.add_items(bytes(&["d", "b", "b"])).unwrap();
        table.add_items(bytes(&["c", "b", "a"])).unwrap();
        table.add_items(Vec::new()).unwrap();

        assert_eq!(table.get_file_parts().unwrap().len(), 2);
        assert_eq!(collect_items(&table), bytes(&["a", "b", "c", "d"]));

        let m = table.metrics().unwrap();
        assert_eq!(m.parts_count, 2);
        assert_eq!(m.items_count, 5);
        assert!(m.size_bytes > 0);
    }

    /// # Scenario
    /// Reopen a table after writes.
    ///
    /// # Expected behavior
    /// The same parts and items are visible.
    #[test]
    fn reopen_preserves_parts() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let table = Table::open(tmp.path(), small_config(2)).unwrap();
            table.add_items(bytes(&["x", "y"])).unwrap();
            table.add_items(bytes(&["z"])).unwrap();
        }
        let table = Table::open(tmp.path(), small_config(2)).unwrap();
        assert_eq!(table.get_file_parts().unwrap().len(), 2);
        assert_eq!(collect_items(&table), bytes(&["x", "y", "z"]));
    }

    /// # Scenario
    /// Debris from an interrupted merge sits next to the live parts.
    ///
    /// # Expected behavior
    /// Open removes the unlisted part and the temp file; live parts stay.
    #[test]
    fn open_removes_orphan_files() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let table = Table::open(tmp.path(), small_config(2)).unwrap();
            table.add_items(bytes(&["keep"])).unwrap();
        }
        fs::write(tmp.path().join("000099.part"), b"junk").unwrap();
        fs::write(tmp.path().join("000100.tmp"), b"junk").unwrap();

        let table = Table::open(tmp.path(), small_config(2)).unwrap();
        assert!(!tmp.path().join("000099.part").exists());
        assert!(!tmp.path().join("000100.tmp").exists());
        assert_eq!(collect_items(&table), bytes(&["keep"]));
    }

    #[test]
    fn corrupted_manifest_fails_open() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let table = Table::open(tmp.path(), small_config(2)).unwrap();
            table.add_items(bytes(&["a"])).unwrap();
        }
        let path = tmp.path().join("parts.manifest");
        let mut raw = fs::read(&path).unwrap();
        raw[5] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        let err = Table::open(tmp.path(), small_config(2)).unwrap_err();
        assert!(matches!(err, TableError::ManifestChecksumMismatch));
        assert!(err.is_fatal());
    }

    /// # Scenario
    /// Claim all parts twice, then release.
    ///
    /// # Expected behavior
    /// The second claim gets nothing; after release the parts are free and
    /// claimable again.
    #[test]
    fn claim_is_exclusive_until_release() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let table = Table::open(tmp.path(), small_config(2)).unwrap();
        table.add_items(bytes(&["a"])).unwrap();
        table.add_items(bytes(&["b"])).unwrap();

        let first = table.claim_free_parts().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|pw| pw.state() == PartState::Claimed));
        assert!(table.claim_free_parts().unwrap().is_empty());

        table.release_parts(&first).unwrap();
        assert!(first.iter().all(|pw| pw.state() == PartState::Free));
        assert_eq!(table.claim_free_parts().unwrap().len(), 2);
    }

    #[test]
    fn merge_of_unclaimed_part_is_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let table = Table::open(tmp.path(), small_config(2)).unwrap();
        table.add_items(bytes(&["a"])).unwrap();

        let parts = table.get_file_parts().unwrap();
        let err = table.merge_parts(&parts, true).unwrap_err();
        assert!(matches!(err, TableError::NotClaimed { .. }));
        assert!(!err.is_fatal());
        assert_eq!(parts[0].state(), PartState::Free);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Table::open(
            tmp.path(),
            TableConfig {
                max_concurrent_merges: 0,
                ..TableConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, TableError::InvalidConfig(_)));
    }
}
