//! Block-header store of a partition.
//!
//! Sample blocks themselves live outside this crate; what the index
//! maintenance needs is the list of `(TSID, time span)` headers of every
//! stored block. Each call to [`BlockStore::add_blocks`] writes one
//! immutable file of headers sorted by TSID:
//!
//! ```text
//! [HEADER: magic "IBH0" | version u32 | headers u64 | rows u64 | crc32]
//! [CHUNK_LEN_LE][BlockHeader * <= 1024][CHUNK_CRC32_LE]
//! ...
//! ```
//!
//! [`PartitionSearch`] walks the files one chunk at a time through a
//! memory map and merge-joins the headers against a sorted TSID list, so
//! memory use does not grow with the number of stored blocks.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    ops::Range,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use memmap2::Mmap;
use tracing::{debug, info};

use crate::encoding::{Decode, Encode, EncodingError, Reader};
use crate::part::crc32;

use super::tsid::{TSID_SIZE, Tsid};
use super::{Deadline, StorageError, TimeRange};

const BLOCKS_HDR_MAGIC: [u8; 4] = *b"IBH0";
const BLOCKS_HDR_VERSION: u32 = 1;
const BLOCKS_HDR_SIZE: usize = 4 + 4 + 8 + 8 + 4;
const HEADERS_PER_CHUNK: usize = 1024;

// ------------------------------------------------------------------------------------------------
// BlockHeader
// ------------------------------------------------------------------------------------------------

/// Header of one stored sample block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Series the block belongs to.
    pub tsid: Tsid,
    /// Smallest sample timestamp (ms).
    pub min_timestamp: i64,
    /// Largest sample timestamp (ms).
    pub max_timestamp: i64,
    /// Samples in the block.
    pub rows_count: u32,
}

impl Encode for BlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.tsid.to_bytes().encode_to(buf)?;
        self.min_timestamp.encode_to(buf)?;
        self.max_timestamp.encode_to(buf)?;
        self.rows_count.encode_to(buf)
    }
}

impl Decode for BlockHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let header = Self {
            tsid: Tsid::from_bytes(&r.read::<[u8; TSID_SIZE]>()?),
            min_timestamp: r.read()?,
            max_timestamp: r.read()?,
            rows_count: r.read()?,
        };
        Ok((header, r.consumed()))
    }
}

// ------------------------------------------------------------------------------------------------
// BlockFile
// ------------------------------------------------------------------------------------------------

/// One memory-mapped block-header file.
#[derive(Debug)]
pub(crate) struct BlockFile {
    path: PathBuf,
    mmap: Mmap,
    headers_count: u64,
    rows_count: u64,
}

impl BlockFile {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let file = File::open(path)?;
        // SAFETY: block files are immutable once renamed into place.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < BLOCKS_HDR_SIZE {
            return Err(StorageError::Corruption(format!(
                "block file {path:?} is too small"
            )));
        }
        let crc_at = BLOCKS_HDR_SIZE - 4;
        let (stored, _) = u32::decode_from(&mmap[crc_at..BLOCKS_HDR_SIZE])?;
        if crc32(&mmap[..crc_at]) != stored {
            return Err(StorageError::ChecksumMismatch {
                path: path.to_path_buf(),
                what: "block file header",
            });
        }
        let (magic, _) = <[u8; 4]>::decode_from(&mmap[..4])?;
        let (version, _) = u32::decode_from(&mmap[4..8])?;
        if magic != BLOCKS_HDR_MAGIC || version != BLOCKS_HDR_VERSION {
            return Err(StorageError::Corruption(format!(
                "block file {path:?} has an unknown header"
            )));
        }
        let (headers_count, _) = u64::decode_from(&mmap[8..16])?;
        let (rows_count, _) = u64::decode_from(&mmap[16..24])?;

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            headers_count,
            rows_count,
        })
    }

    /// Verifies the chunk at `offset`; returns its content range and the
    /// offset of the next chunk.
    fn chunk_at(&self, offset: usize) -> Result<(Range<usize>, usize), StorageError> {
        let mmap = &self.mmap[..];
        let truncated = || StorageError::Corruption(format!("block file {:?} is truncated", self.path));

        let (len, _) = u32::decode_from(mmap.get(offset..).ok_or_else(truncated)?)?;
        let start = offset + 4;
        let end = start + len as usize;
        let crc_end = end + 4;
        if crc_end > mmap.len() {
            return Err(truncated());
        }
        let (stored, _) = u32::decode_from(&mmap[end..crc_end])?;
        if crc32(&mmap[start..end]) != stored {
            return Err(StorageError::ChecksumMismatch {
                path: self.path.clone(),
                what: "block header chunk",
            });
        }
        Ok((start..end, crc_end))
    }
}

fn write_block_file(path: &Path, headers: &[BlockHeader]) -> Result<(), StorageError> {
    let rows: u64 = headers.iter().map(|h| u64::from(h.rows_count)).sum();

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(&mut file);

    let mut hdr = Vec::with_capacity(BLOCKS_HDR_SIZE);
    BLOCKS_HDR_MAGIC.encode_to(&mut hdr)?;
    BLOCKS_HDR_VERSION.encode_to(&mut hdr)?;
    (headers.len() as u64).encode_to(&mut hdr)?;
    rows.encode_to(&mut hdr)?;
    let crc = crc32(&hdr);
    crc.encode_to(&mut hdr)?;
    writer.write_all(&hdr)?;

    let mut chunk = Vec::new();
    for group in headers.chunks(HEADERS_PER_CHUNK) {
        chunk.clear();
        for h in group {
            h.encode_to(&mut chunk)?;
        }
        writer.write_all(&(chunk.len() as u32).to_le_bytes())?;
        writer.write_all(&chunk)?;
        writer.write_all(&crc32(&chunk).to_le_bytes())?;
    }

    writer.flush()?;
    drop(writer);
    file.sync_all()?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// BlockStore
// ------------------------------------------------------------------------------------------------

/// Directory of block-header files.
#[derive(Debug)]
pub struct BlockStore {
    dir: PathBuf,
    files: RwLock<Vec<Arc<BlockFile>>>,
    next_id: AtomicU64,
}

impl BlockStore {
    /// Opens (or creates) the store in `dir`. Leftover temporary files are
    /// removed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(".tmp") {
                info!(file = %name, "removing leftover block file");
                fs::remove_file(entry.path())?;
            } else if let Some(id) = name.strip_suffix(".blocks").and_then(|s| s.parse::<u64>().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut files = Vec::with_capacity(ids.len());
        for id in &ids {
            files.push(Arc::new(BlockFile::open(&dir.join(format!("{id:06}.blocks")))?));
        }

        Ok(Self {
            dir,
            files: RwLock::new(files),
            next_id: AtomicU64::new(ids.last().map_or(1, |id| id + 1)),
        })
    }

    /// Persists `headers` as a new file. An empty batch is a no-op.
    pub fn add_blocks(&self, mut headers: Vec<BlockHeader>) -> Result<(), StorageError> {
        if headers.is_empty() {
            return Ok(());
        }
        headers.sort_by(|a, b| {
            a.tsid
                .cmp(&b.tsid)
                .then(a.min_timestamp.cmp(&b.min_timestamp))
        });

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let path = self.dir.join(format!("{id:06}.blocks"));
        let tmp_path = path.with_extension("tmp");
        if let Err(e) = write_block_file(&tmp_path, &headers) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, &path)?;
        File::open(&self.dir)?.sync_all()?;

        let file = Arc::new(BlockFile::open(&path)?);
        self.files
            .write()
            .map_err(|_| StorageError::Internal("RwLock poisoned".into()))?
            .push(file);

        debug!(path = ?path, blocks = headers.len(), "block headers written");
        Ok(())
    }

    /// Total `(blocks, rows)` stored.
    pub fn counts(&self) -> Result<(u64, u64), StorageError> {
        let files = self
            .files
            .read()
            .map_err(|_| StorageError::Internal("RwLock poisoned".into()))?;
        Ok(files.iter().fold((0, 0), |(b, r), f| {
            (b + f.headers_count, r + f.rows_count)
        }))
    }

    /// Streaming search for blocks of `tsids` overlapping `range`.
    ///
    /// # Errors
    ///
    /// [`StorageError::UnsortedTsids`] when `tsids` is not sorted.
    pub fn search(
        &self,
        tsids: &[Tsid],
        range: TimeRange,
        deadline: Deadline,
    ) -> Result<PartitionSearch, StorageError> {
        if let Some(pos) = tsids.windows(2).position(|w| w[0] > w[1]) {
            return Err(StorageError::UnsortedTsids { index: pos + 1 });
        }
        let files = self
            .files
            .read()
            .map_err(|_| StorageError::Internal("RwLock poisoned".into()))?
            .clone();

        Ok(PartitionSearch {
            files,
            tsids: tsids.to_vec(),
            range,
            deadline,
            file_idx: 0,
            offset: BLOCKS_HDR_SIZE,
            chunk: None,
            tsid_idx: 0,
            current: BlockHeader::default(),
            processed: 0,
            err: None,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// PartitionSearch
// ------------------------------------------------------------------------------------------------

/// Cursor over the stored blocks matching a sorted TSID list.
pub struct PartitionSearch {
    files: Vec<Arc<BlockFile>>,
    tsids: Vec<Tsid>,
    range: TimeRange,
    deadline: Deadline,
    file_idx: usize,

    /// Offset of the next chunk in the current file.
    offset: usize,

    /// Unread part of the loaded chunk.
    chunk: Option<Range<usize>>,

    tsid_idx: usize,
    current: BlockHeader,
    processed: u64,
    err: Option<StorageError>,
}

impl PartitionSearch {
    /// Advances to the next matching block. Returns `false` at the end or
    /// on error.
    pub fn next_block(&mut self) -> bool {
        if self.err.is_some() || self.tsids.is_empty() {
            return false;
        }
        loop {
            let header = match self.next_header() {
                Ok(Some(h)) => h,
                Ok(None) => return false,
                Err(e) => {
                    self.err = Some(e);
                    return false;
                }
            };
            if let Err(e) = self.deadline.check(self.processed) {
                self.err = Some(e);
                return false;
            }
            self.processed += 1;

            while self.tsid_idx < self.tsids.len() && self.tsids[self.tsid_idx] < header.tsid {
                self.tsid_idx += 1;
            }
            if self.tsid_idx == self.tsids.len() {
                // Headers are sorted: nothing further in this file matches.
                self.next_file();
                continue;
            }
            if self.tsids[self.tsid_idx] != header.tsid
                || !self.range.overlaps(header.min_timestamp, header.max_timestamp)
            {
                continue;
            }
            self.current = header;
            return true;
        }
    }

    /// Header of the current block.
    pub fn block_header(&self) -> &BlockHeader {
        &self.current
    }

    /// Headers read so far, matching or not.
    pub fn blocks_processed(&self) -> u64 {
        self.processed
    }

    /// Terminal error, distinct from exhaustion.
    pub fn error(&self) -> Option<&StorageError> {
        self.err.as_ref()
    }

    /// Takes the terminal error out of the cursor.
    pub fn take_error(&mut self) -> Option<StorageError> {
        self.err.take()
    }

    fn next_file(&mut self) {
        self.file_idx += 1;
        self.offset = BLOCKS_HDR_SIZE;
        self.chunk = None;
        self.tsid_idx = 0;
    }

    fn next_header(&mut self) -> Result<Option<BlockHeader>, StorageError> {
        loop {
            let Some(file) = self.files.get(self.file_idx).cloned() else {
                return Ok(None);
            };

            if let Some(chunk) = self.chunk.clone() {
                if chunk.start < chunk.end {
                    let (header, n) = BlockHeader::decode_from(&file.mmap[chunk.clone()])?;
                    self.chunk = Some(chunk.start + n..chunk.end);
                    return Ok(Some(header));
                }
                self.chunk = None;
            }

            if self.offset >= file.mmap.len() {
                self.next_file();
                continue;
            }
            let (content, next) = file.chunk_at(self.offset)?;
            self.chunk = Some(content);
            self.offset = next;
        }
    }
}
