//! Sorted Part Module
//!
//! A part is an **immutable**, **memory-mapped** file holding a strictly
//! increasing sequence of byte-string items. Parts are the unit the index
//! table merges: new parts are produced by [`PartWriter`], read through
//! [`PartSearch`] and retired once a merge has replaced them.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER: magic "IPT0" | version u32 | crc32]
//! [DATA_BLOCK_LEN_LE][ITEM*][DATA_BLOCK_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][ITEM*][DATA_BLOCK_CRC32_LE]
//! ...
//! [METADATA_LEN_LE][PartMetadata][METADATA_CRC32_LE]
//! [INDEX_LEN_LE][Vec<PartIndexEntry>][INDEX_CRC32_LE]
//! [FOOTER: metadata handle | index handle | total_file_size | crc32]
//! ```
//!
//! - Every item inside a data block is encoded as `[u32 len][bytes]`.
//! - The index block stores the first item of every data block, so a seek
//!   is a binary search over the index followed by a linear scan of one
//!   block.
//! - Every block and the header/footer carry a CRC32. A mismatch while
//!   iterating is reported through [`PartSearch::error`], never silently
//!   treated as the end of data.
//!
//! # Sub-modules
//!
//! - [`builder`]: [`PartWriter`] for building parts from sorted items.
//! - [`search`]: [`PartSearch`], the seek-and-iterate cursor.
//! - [`validate`]: [`validate_order`], the structural order check.

pub mod builder;
pub mod search;
pub mod validate;

#[cfg(test)]
mod tests;

pub use builder::PartWriter;
pub use search::PartSearch;
pub use validate::validate_order;

use std::{
    fmt,
    fs::File,
    io,
    ops::Range,
    path::{Path, PathBuf},
};

use crate::encoding::{self, Decode, Encode, EncodingError, Reader};
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const PART_HDR_MAGIC: [u8; 4] = *b"IPT0";
const PART_HDR_VERSION: u32 = 1;
const PART_HDR_SIZE: usize = 12;
const PART_FOOTER_SIZE: usize = 44;
const PART_BLOCK_LEN_SIZE: usize = 4;
const PART_BLOCK_CHECKSUM_SIZE: usize = 4;

/// Target size of a data block before it is flushed by the writer.
pub const PART_DATA_BLOCK_MAX_SIZE: usize = 64 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by part operations (open, build, search, validation).
#[derive(Debug, Error)]
pub enum PartError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Stored and computed CRC32 differ.
    #[error("checksum mismatch in {what}")]
    ChecksumMismatch {
        /// Which structure failed verification.
        what: &'static str,
    },

    /// Items handed to the writer were not strictly increasing.
    #[error("items are not strictly increasing at item #{index}")]
    Unsorted {
        /// Zero-based position of the offending item.
        index: u64,
    },

    /// The writer was given no items.
    #[error("cannot build a part without items")]
    Empty,

    /// A seek for a leading byte returned an item with a smaller leading
    /// byte.
    #[error(
        "search in part {path:?} returned item with first byte {found} < sought byte {sought}"
    )]
    OrderViolation {
        /// Part file path.
        path: PathBuf,
        /// Leading byte that was sought.
        sought: u8,
        /// Leading byte of the returned item.
        found: u8,
    },

    /// Structural problem in the file (bad magic, out-of-range handle, …).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PartError {
    /// Whether the error signals on-disk corruption or a broken ordering
    /// invariant. Plain I/O failures and empty input are not fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PartError::Io(_) | PartError::Empty)
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Location of a checksummed block inside the part file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    /// Offset of the length prefix.
    pub(crate) offset: u64,

    /// Size of the block including length prefix and checksum.
    pub(crate) size: u64,
}

/// Part-level statistics stored in the metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMetadata {
    /// Creation time (UNIX epoch millis).
    pub creation_timestamp: u64,

    /// Number of items in the part.
    pub items_count: u64,

    /// Number of data blocks.
    pub blocks_count: u64,

    /// Smallest item.
    pub first_item: Vec<u8>,

    /// Largest item.
    pub last_item: Vec<u8>,
}

/// Index entry: first item of a data block plus its location.
#[derive(Debug, Clone)]
pub(crate) struct PartIndexEntry {
    pub(crate) first_item: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

/// Footer stored at the very end of the file.
pub(crate) struct PartFooter {
    pub(crate) metadata: BlockHandle,
    pub(crate) index: BlockHandle,
    pub(crate) total_file_size: u64,
    pub(crate) footer_crc32: u32,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let offset = r.read()?;
        let size = r.read()?;
        Ok((Self { offset, size }, r.consumed()))
    }
}

impl Encode for PartMetadata {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.creation_timestamp.encode_to(buf)?;
        self.items_count.encode_to(buf)?;
        self.blocks_count.encode_to(buf)?;
        self.first_item.encode_to(buf)?;
        self.last_item.encode_to(buf)
    }
}

impl Decode for PartMetadata {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let metadata = Self {
            creation_timestamp: r.read()?,
            items_count: r.read()?,
            blocks_count: r.read()?,
            first_item: r.read()?,
            last_item: r.read()?,
        };
        Ok((metadata, r.consumed()))
    }
}

impl Encode for PartIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_item.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for PartIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let first_item = r.read()?;
        let handle = r.read()?;
        Ok((Self { first_item, handle }, r.consumed()))
    }
}

impl Encode for PartFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.metadata.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.total_file_size.encode_to(buf)?;
        self.footer_crc32.encode_to(buf)
    }
}

impl Decode for PartFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let footer = Self {
            metadata: r.read()?,
            index: r.read()?,
            total_file_size: r.read()?,
            footer_crc32: r.read()?,
        };
        Ok((footer, r.consumed()))
    }
}

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// Part: immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable sorted part.
pub struct Part {
    path: PathBuf,
    mmap: Mmap,
    metadata: PartMetadata,
    index: Vec<PartIndexEntry>,
    footer: PartFooter,
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("path", &self.path)
            .field("items_count", &self.metadata.items_count)
            .field("size_bytes", &self.footer.total_file_size)
            .finish_non_exhaustive()
    }
}

impl Part {
    /// Opens a part file, verifying header, footer, metadata and index
    /// checksums. Data blocks are verified lazily when a search loads them.
    ///
    /// # Errors
    ///
    /// - [`PartError::ChecksumMismatch`] if any eagerly checked structure
    ///   fails verification.
    /// - [`PartError::Internal`] for a bad magic/version, a truncated file
    ///   or out-of-range block handles.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PartError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        // SAFETY: parts are never written after the rename that publishes
        // them, and every handle is bounds-checked before slicing.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < PART_HDR_SIZE + PART_FOOTER_SIZE {
            return Err(PartError::Internal(format!(
                "part {path:?} is too small ({} bytes)",
                mmap.len()
            )));
        }

        let (magic, _) = encoding::decode_from_slice::<[u8; 4]>(&mmap[..4])?;
        let (version, _) = encoding::decode_from_slice::<u32>(&mmap[4..8])?;
        let (header_crc, _) = encoding::decode_from_slice::<u32>(&mmap[8..PART_HDR_SIZE])?;
        if crc32(&mmap[..8]) != header_crc {
            return Err(PartError::ChecksumMismatch { what: "header" });
        }
        if magic != PART_HDR_MAGIC {
            return Err(PartError::Internal("part header magic mismatch".into()));
        }
        if version != PART_HDR_VERSION {
            return Err(PartError::Internal(format!(
                "unsupported part version {version}"
            )));
        }

        let footer_start = mmap.len() - PART_FOOTER_SIZE;
        let (footer, _) = encoding::decode_from_slice::<PartFooter>(&mmap[footer_start..])?;
        if crc32(&mmap[footer_start..mmap.len() - 4]) != footer.footer_crc32 {
            return Err(PartError::ChecksumMismatch { what: "footer" });
        }
        if footer.total_file_size != mmap.len() as u64 {
            return Err(PartError::Internal(format!(
                "part {path:?} size {} differs from recorded size {}",
                mmap.len(),
                footer.total_file_size
            )));
        }

        let meta_range = Self::checked_block(&mmap, &footer.metadata, "metadata")?;
        let (metadata, _) = encoding::decode_from_slice::<PartMetadata>(&mmap[meta_range])?;

        let index_range = Self::checked_block(&mmap, &footer.index, "index")?;
        let (index, _) = encoding::decode_vec::<PartIndexEntry>(&mmap[index_range])?;

        if index.len() as u64 != metadata.blocks_count {
            return Err(PartError::Internal(format!(
                "part {path:?} index has {} entries, metadata says {} blocks",
                index.len(),
                metadata.blocks_count
            )));
        }

        Ok(Self {
            path,
            mmap,
            metadata,
            index,
            footer,
        })
    }

    /// Path of the part file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// On-disk size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.footer.total_file_size
    }

    /// Number of items stored in the part.
    pub fn items_count(&self) -> u64 {
        self.metadata.items_count
    }

    /// Number of data blocks.
    pub fn blocks_count(&self) -> u64 {
        self.metadata.blocks_count
    }

    /// Part statistics.
    pub fn metadata(&self) -> &PartMetadata {
        &self.metadata
    }

    /// Returns a cursor over this part. Call [`PartSearch::seek`] before
    /// iterating.
    pub fn search(&self) -> PartSearch<&Part> {
        PartSearch::new(self)
    }

    /// Raw mapped bytes.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Index of the last block whose first item is `<= key`; `0` when the
    /// key sorts before every block.
    pub(crate) fn find_block_for_key(&self, key: &[u8]) -> usize {
        self.index
            .partition_point(|entry| entry.first_item.as_slice() <= key)
            .saturating_sub(1)
    }

    /// Verifies the checksum of data block `idx` and returns the byte range
    /// of its content inside the mmap, or `None` past the last block.
    pub(crate) fn data_block(&self, idx: usize) -> Result<Option<Range<usize>>, PartError> {
        match self.index.get(idx) {
            Some(entry) => Self::checked_block(&self.mmap, &entry.handle, "data block").map(Some),
            None => Ok(None),
        }
    }

    /// Validates a `[len][content][crc]` block and returns the content
    /// range.
    fn checked_block(
        mmap: &[u8],
        handle: &BlockHandle,
        what: &'static str,
    ) -> Result<Range<usize>, PartError> {
        let start = usize::try_from(handle.offset)
            .map_err(|_| PartError::Internal("block offset exceeds addressable range".into()))?;
        let size = usize::try_from(handle.size)
            .map_err(|_| PartError::Internal("block size exceeds addressable range".into()))?;

        let end = start
            .checked_add(size)
            .filter(|end| *end <= mmap.len())
            .ok_or_else(|| PartError::Internal(format!("{what} out of range")))?;
        if size < PART_BLOCK_LEN_SIZE + PART_BLOCK_CHECKSUM_SIZE {
            return Err(PartError::Internal(format!("{what} too short")));
        }

        let (content_len, _) = encoding::decode_from_slice::<u32>(&mmap[start..end])?;
        let content_start = start + PART_BLOCK_LEN_SIZE;
        let content_end = content_start + content_len as usize;
        if content_end + PART_BLOCK_CHECKSUM_SIZE != end {
            return Err(PartError::Internal(format!("{what} length mismatch")));
        }

        let (stored, _) = encoding::decode_from_slice::<u32>(&mmap[content_end..end])?;
        if crc32(&mmap[content_start..content_end]) != stored {
            return Err(PartError::ChecksumMismatch { what });
        }

        Ok(content_start..content_end)
    }
}
