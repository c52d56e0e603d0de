use std::fs;
use std::path::Path;

use crate::encoding::{self, Encode};
use crate::part::{BlockHandle, PartFooter, PartIndexEntry, PartMetadata, crc32};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sorted, deduplicated copy of `items`.
pub fn sorted(mut items: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    items.sort();
    items.dedup();
    items
}

/// Writes a part file by hand, bypassing every writer check.
///
/// Each entry of `blocks` is `(index first item, block items)`; the index
/// entry is stored verbatim so tests can describe blocks that lie about
/// their contents.
pub fn write_raw_part(path: &Path, blocks: &[(Vec<u8>, Vec<Vec<u8>>)]) {
    fn block(out: &mut Vec<u8>, data: &[u8]) -> BlockHandle {
        let offset = out.len() as u64;
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(&crc32(data).to_le_bytes());
        BlockHandle {
            offset,
            size: (data.len() + 8) as u64,
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"IPT0");
    out.extend_from_slice(&1u32.to_le_bytes());
    let crc = crc32(&out);
    out.extend_from_slice(&crc.to_le_bytes());

    let mut index = Vec::new();
    let mut count = 0u64;
    for (first_item, items) in blocks {
        let mut data = Vec::new();
        for item in items {
            item.as_slice().encode_to(&mut data).unwrap();
            count += 1;
        }
        let handle = block(&mut out, &data);
        index.push(PartIndexEntry {
            first_item: first_item.clone(),
            handle,
        });
    }

    let metadata = PartMetadata {
        creation_timestamp: 1,
        items_count: count,
        blocks_count: blocks.len() as u64,
        first_item: Vec::new(),
        last_item: Vec::new(),
    };
    let metadata = block(&mut out, &encoding::encode_to_vec(&metadata).unwrap());
    let mut index_bytes = Vec::new();
    encoding::encode_vec(&index, &mut index_bytes).unwrap();
    let index = block(&mut out, &index_bytes);

    let mut footer = PartFooter {
        metadata,
        index,
        total_file_size: out.len() as u64 + 44,
        footer_crc32: 0,
    };
    let bytes = encoding::encode_to_vec(&footer).unwrap();
    footer.footer_crc32 = crc32(&bytes[..bytes.len() - 4]);
    out.extend_from_slice(&encoding::encode_to_vec(&footer).unwrap());

    fs::write(path, out).unwrap();
}
