//! Seek / iterate cursor tests.

#[cfg(test)]
mod tests {
    use crate::part::tests::helpers::{init_tracing, sorted};
    use crate::part::{Part, PartWriter};
    use rand::Rng;
    use tempfile::TempDir;

    fn open_with(tmp: &TempDir, items: &[Vec<u8>], block_size: usize) -> Part {
        let path = tmp.path().join("000001.part");
        PartWriter::new(&path)
            .with_block_size(block_size)
            .build(items)
            .unwrap();
        Part::open(&path).unwrap()
    }

    /// # Scenario
    /// Seek to a key that is absent, present, and past the end.
    ///
    /// # Expected behavior
    /// Next item is the first `>= key`; past the end `next_item` is false
    /// without an error.
    #[test]
    fn seek_positions_at_first_item_not_less_than_key() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let items: Vec<Vec<u8>> = vec![b"b".to_vec(), b"d".to_vec(), b"f".to_vec(), b"h".to_vec()];
        let part = open_with(&tmp, &items, 4);
        let mut ps = part.search();

        ps.seek(b"c");
        assert!(ps.next_item());
        assert_eq!(ps.item(), b"d");

        ps.seek(b"f");
        assert!(ps.next_item());
        assert_eq!(ps.item(), b"f");
        assert!(ps.next_item());
        assert_eq!(ps.item(), b"h");
        assert!(!ps.next_item());

        ps.seek(b"a");
        assert!(ps.next_item());
        assert_eq!(ps.item(), b"b");

        ps.seek(b"z");
        assert!(!ps.next_item());
        assert!(ps.error().is_none());
    }

    /// # Scenario
    /// Exhaust the cursor, then seek again.
    ///
    /// # Expected behavior
    /// The cursor is reusable after exhaustion.
    #[test]
    fn seek_after_exhaustion_restarts_iteration() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let items: Vec<Vec<u8>> = (0u8..20).map(|b| vec![b]).collect();
        let part = open_with(&tmp, &items, 8);
        let mut ps = part.search();

        ps.seek(&[0]);
        let mut n = 0;
        while ps.next_item() {
            n += 1;
        }
        assert_eq!(n, 20);
        assert!(!ps.next_item());

        ps.seek(&[7]);
        assert!(ps.next_item());
        assert_eq!(ps.item(), &[7]);
    }

    /// # Scenario
    /// Prefix scan idiom used by the index readers.
    #[test]
    fn prefix_scan_stops_at_prefix_boundary() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let items = sorted(vec![
            b"\x01aaa".to_vec(),
            b"\x02aaa".to_vec(),
            b"\x02bbb".to_vec(),
            b"\x02ccc".to_vec(),
            b"\x03aaa".to_vec(),
        ]);
        let part = open_with(&tmp, &items, 10);
        let mut ps = part.search();

        let prefix = [2u8];
        ps.seek(&prefix);
        let mut got = Vec::new();
        while ps.next_item() {
            if !ps.item().starts_with(&prefix) {
                break;
            }
            got.push(ps.item().to_vec());
        }
        assert_eq!(got, items[1..4].to_vec());
    }

    /// # Scenario
    /// Random item sets, random block sizes, random seek keys.
    ///
    /// # Expected behavior
    /// For every key, the cursor yields exactly the suffix of the sorted
    /// input that starts at the first item `>= key`.
    #[test]
    fn random_seeks_match_sorted_reference() {
        init_tracing();
        let mut rng = rand::rng();

        for round in 0..20 {
            let tmp = TempDir::new().unwrap();
            let n = rng.random_range(1..400);
            let raw: Vec<Vec<u8>> = (0..n)
                .map(|_| {
                    let len = rng.random_range(0..6);
                    (0..len).map(|_| rng.random_range(0..8u8)).collect()
                })
                .collect();
            let items = sorted(raw);
            let part = open_with(&tmp, &items, rng.random_range(1..256));

            for _ in 0..50 {
                let key_len = rng.random_range(0..5);
                let key: Vec<u8> = (0..key_len).map(|_| rng.random_range(0..8u8)).collect();
                let start = items.partition_point(|it| it.as_slice() < key.as_slice());

                let mut ps = part.search();
                ps.seek(&key);
                let mut got = Vec::new();
                while ps.next_item() {
                    got.push(ps.item().to_vec());
                }
                assert!(ps.error().is_none());
                assert_eq!(got, items[start..].to_vec(), "round {round} key {key:?}");
            }
        }
    }
}
