//! Parts manifest: the durable list of live parts of one table.
//!
//! The manifest is a single checksummed snapshot file rewritten in full on
//! every change:
//!
//! ```text
//! [version u32][next_part_id u64][Vec<u64> part_ids][crc32]
//! ```
//!
//! Writes go to `parts.manifest.tmp`, are synced, renamed over the live
//! file and the directory is fsynced. A part file is live iff its id is
//! listed here; anything else in the table directory is debris from an
//! interrupted merge and is removed when the table opens.

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::encoding::{self, Decode, Encode, EncodingError, Reader};
use crate::part::crc32;

use super::TableError;

const MANIFEST_FILENAME: &str = "parts.manifest";
const MANIFEST_TMP_FILENAME: &str = "parts.manifest.tmp";
const MANIFEST_VERSION: u32 = 1;

/// File name of the part with the given id.
pub(crate) fn part_file_name(id: u64) -> String {
    format!("{id:06}.part")
}

/// Parses an id out of a `NNNNNN.part` file name.
pub(crate) fn parse_part_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".part")?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ManifestData {
    next_part_id: u64,
    part_ids: Vec<u64>,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self {
            next_part_id: 1,
            part_ids: Vec::new(),
        }
    }
}

impl Encode for ManifestData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        MANIFEST_VERSION.encode_to(buf)?;
        self.next_part_id.encode_to(buf)?;
        encoding::encode_vec(&self.part_ids, buf)
    }
}

impl Decode for ManifestData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut r = Reader::new(buf);
        let version: u32 = r.read()?;
        if version != MANIFEST_VERSION {
            return Err(EncodingError::InvalidTag {
                tag: version,
                type_name: "parts manifest version",
            });
        }
        let data = Self {
            next_part_id: r.read()?,
            part_ids: r.read_vec()?,
        };
        Ok((data, r.consumed()))
    }
}

/// Durable list of live part ids plus the id allocator.
#[derive(Debug)]
pub(crate) struct PartsManifest {
    dir: PathBuf,
    data: ManifestData,
}

impl PartsManifest {
    /// Loads the manifest from `dir`, starting empty if none exists.
    pub(crate) fn open(dir: &Path) -> Result<Self, TableError> {
        let path = dir.join(MANIFEST_FILENAME);
        let data = match fs::read(&path) {
            Ok(bytes) => Self::decode(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(dir = ?dir, "no parts manifest, starting empty");
                ManifestData::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            data,
        })
    }

    fn decode(bytes: &[u8]) -> Result<ManifestData, TableError> {
        if bytes.len() < 4 {
            return Err(TableError::ManifestChecksumMismatch);
        }
        let (payload, stored) = bytes.split_at(bytes.len() - 4);
        let (stored, _) = u32::decode_from(stored)?;
        if crc32(payload) != stored {
            return Err(TableError::ManifestChecksumMismatch);
        }
        let (data, _) = ManifestData::decode_from(payload)?;
        Ok(data)
    }

    /// Live part ids, in insertion order.
    pub(crate) fn part_ids(&self) -> &[u64] {
        &self.data.part_ids
    }

    /// Reserves a fresh part id. The reservation becomes durable with the
    /// next [`commit`](Self::commit) that lists it.
    pub(crate) fn allocate_part_id(&mut self) -> u64 {
        let id = self.data.next_part_id;
        self.data.next_part_id += 1;
        id
    }

    /// Replaces `removed` with `added` and persists the result. In-memory
    /// state changes only after the snapshot is durable.
    pub(crate) fn commit(&mut self, added: Option<u64>, removed: &[u64]) -> Result<(), TableError> {
        let mut next = self.data.clone();
        next.part_ids.retain(|id| !removed.contains(id));
        if let Some(id) = added {
            next.part_ids.push(id);
            next.next_part_id = next.next_part_id.max(id + 1);
        }

        self.write_snapshot(&next)?;
        self.data = next;
        Ok(())
    }

    fn write_snapshot(&self, data: &ManifestData) -> Result<(), TableError> {
        let mut bytes = encoding::encode_to_vec(data)?;
        let crc = crc32(&bytes);
        crc.encode_to(&mut bytes)?;

        let tmp_path = self.dir.join(MANIFEST_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }

        fs::rename(&tmp_path, self.dir.join(MANIFEST_FILENAME))?;
        File::open(&self.dir)?.sync_all()?;

        debug!(dir = ?self.dir, parts = data.part_ids.len(), "parts manifest written");
        Ok(())
    }

    /// Removes part files that are not listed in the manifest and
    /// temporary files left behind by interrupted writes.
    pub(crate) fn remove_orphans(&self) -> Result<usize, TableError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let orphan = match parse_part_file_name(name) {
                Some(id) => !self.data.part_ids.contains(&id),
                None => name.ends_with(".tmp"),
            };
            if orphan {
                info!(file = %name, dir = ?self.dir, "removing orphan table file");
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
