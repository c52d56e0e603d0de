//! Free-space probing for merge admission.
//!
//! The probe is a best-effort heuristic: concurrent merges and unrelated
//! processes may consume space between the check and the write.

use std::{io, path::Path};

use nix::sys::statvfs::statvfs;

/// Reports bytes available to unprivileged writers on the filesystem
/// holding `path`.
pub trait FreeSpaceProbe: Send + Sync {
    /// Available bytes at `path`.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`FreeSpaceProbe`] backed by `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl FreeSpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let stat = statvfs(path).map_err(io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        let avail = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
        Ok(avail)
    }
}
