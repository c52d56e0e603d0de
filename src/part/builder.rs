//! Part writer: builds a complete part file from a sorted item stream.
//!
//! Items must be **strictly increasing**; the writer checks this as it
//! streams and fails with [`PartError::Unsorted`] otherwise, so a bug in a
//! merge can never publish an unordered part.
//!
//! Only the current data block and the block index are held in memory,
//! so merges of arbitrarily large parts run in bounded memory.
//!
//! # Atomicity
//!
//! 1. Write everything to `path.tmp`.
//! 2. Flush and sync the file.
//! 3. Rename `path.tmp` → `path`.
//!
//! On error the temporary file is removed; a crash leaves at most a
//! `.tmp` file that the table ignores.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Seek, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::encoding::{self, Encode};

use super::{
    BlockHandle, PART_BLOCK_CHECKSUM_SIZE, PART_BLOCK_LEN_SIZE, PART_DATA_BLOCK_MAX_SIZE,
    PART_FOOTER_SIZE, PART_HDR_MAGIC, PART_HDR_VERSION, PartError, PartFooter, PartIndexEntry,
    PartMetadata, crc32,
};

/// Writes a checksummed block `[len_le][data][crc32_le]` and returns its
/// handle.
fn write_checksummed_block(
    writer: &mut (impl Write + Seek),
    data: &[u8],
) -> Result<BlockHandle, PartError> {
    let offset = writer.stream_position()?;
    let len = u32::try_from(data.len())
        .map_err(|_| PartError::Internal(format!("block of {} bytes too large", data.len())))?;

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&crc32(data).to_le_bytes())?;

    Ok(BlockHandle {
        offset,
        size: (PART_BLOCK_LEN_SIZE + data.len() + PART_BLOCK_CHECKSUM_SIZE) as u64,
    })
}

fn write_header(writer: &mut impl Write) -> Result<(), PartError> {
    let mut header = Vec::with_capacity(12);
    PART_HDR_MAGIC.encode_to(&mut header)?;
    PART_HDR_VERSION.encode_to(&mut header)?;
    let crc = crc32(&header);
    crc.encode_to(&mut header)?;
    writer.write_all(&header)?;
    Ok(())
}

fn write_footer(
    writer: &mut (impl Write + Seek),
    metadata: BlockHandle,
    index: BlockHandle,
) -> Result<(), PartError> {
    let total_file_size = writer.stream_position()? + PART_FOOTER_SIZE as u64;
    let mut footer = PartFooter {
        metadata,
        index,
        total_file_size,
        footer_crc32: 0,
    };
    let bytes = encoding::encode_to_vec(&footer)?;
    footer.footer_crc32 = crc32(&bytes[..bytes.len() - 4]);
    writer.write_all(&encoding::encode_to_vec(&footer)?)?;
    Ok(())
}

/// Streaming state of one build.
struct BlockBuilder {
    block_size: usize,
    current: Vec<u8>,
    current_first: Option<Vec<u8>>,
    index: Vec<PartIndexEntry>,
    items_count: u64,
    first_item: Option<Vec<u8>>,
    last_item: Vec<u8>,
}

impl BlockBuilder {
    fn push(&mut self, writer: &mut (impl Write + Seek), item: &[u8]) -> Result<(), PartError> {
        if self.first_item.is_some() && item <= self.last_item.as_slice() {
            return Err(PartError::Unsorted {
                index: self.items_count,
            });
        }
        if self.first_item.is_none() {
            self.first_item = Some(item.to_vec());
        }
        if self.current_first.is_none() {
            self.current_first = Some(item.to_vec());
        }
        self.last_item.clear();
        self.last_item.extend_from_slice(item);
        self.items_count += 1;

        item.encode_to(&mut self.current)?;
        if self.current.len() >= self.block_size {
            self.flush(writer)?;
        }
        Ok(())
    }

    fn flush(&mut self, writer: &mut (impl Write + Seek)) -> Result<(), PartError> {
        let Some(first_item) = self.current_first.take() else {
            return Ok(());
        };
        let handle = write_checksummed_block(writer, &self.current)?;
        self.current.clear();
        self.index.push(PartIndexEntry { first_item, handle });
        Ok(())
    }
}

/// Builds a part file on disk.
///
/// # Example
///
/// ```rust,ignore
/// let meta = PartWriter::new(&path).build(items.iter())?;
/// ```
pub struct PartWriter<P: AsRef<Path>> {
    path: P,
    block_size: usize,
}

impl<P: AsRef<Path>> PartWriter<P> {
    /// Create a writer targeting the given output path.
    pub fn new(path: P) -> Self {
        Self {
            path,
            block_size: PART_DATA_BLOCK_MAX_SIZE,
        }
    }

    /// Overrides the target data-block size (bytes, at least 1).
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Consumes a strictly increasing item stream and writes a complete
    /// part, returning its metadata.
    ///
    /// # Errors
    ///
    /// - [`PartError::Empty`] if the stream yields nothing.
    /// - [`PartError::Unsorted`] if an item is not greater than its
    ///   predecessor.
    /// - I/O errors from writing, syncing or renaming.
    pub fn build<I>(self, items: I) -> Result<PartMetadata, PartError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("tmp");

        let result = Self::write_tmp(&tmp_path, self.block_size, items);
        match result {
            Ok(metadata) => {
                fs::rename(&tmp_path, final_path)?;
                Ok(metadata)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp_path) {
                    tracing::debug!(path = ?tmp_path, error = %rm, "could not remove temporary part");
                }
                Err(e)
            }
        }
    }

    fn write_tmp<I>(tmp_path: &Path, block_size: usize, items: I) -> Result<PartMetadata, PartError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut file: File = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut writer = BufWriter::new(&mut file);

        // 1. Header
        write_header(&mut writer)?;

        // 2. Data blocks
        let mut blocks = BlockBuilder {
            block_size,
            current: Vec::with_capacity(block_size.min(PART_DATA_BLOCK_MAX_SIZE)),
            current_first: None,
            index: Vec::new(),
            items_count: 0,
            first_item: None,
            last_item: Vec::new(),
        };
        for item in items {
            blocks.push(&mut writer, item.as_ref())?;
        }
        blocks.flush(&mut writer)?;

        let Some(first_item) = blocks.first_item else {
            return Err(PartError::Empty);
        };

        // 3. Metadata block
        let metadata = PartMetadata {
            creation_timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            items_count: blocks.items_count,
            blocks_count: blocks.index.len() as u64,
            first_item,
            last_item: blocks.last_item,
        };
        let meta_handle = write_checksummed_block(&mut writer, &encoding::encode_to_vec(&metadata)?)?;

        // 4. Index block
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&blocks.index, &mut index_bytes)?;
        let index_handle = write_checksummed_block(&mut writer, &index_bytes)?;

        // 5. Footer + sync
        write_footer(&mut writer, meta_handle, index_handle)?;
        writer.flush()?;
        drop(writer);
        file.sync_all()?;

        Ok(metadata)
    }
}
