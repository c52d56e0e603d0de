//! Tenant and TSID identifiers.

use std::{fmt, str::FromStr};

use thiserror::Error;

use super::StorageError;

/// Size of a marshalled [`Tsid`].
pub const TSID_SIZE: usize = 32;

// ------------------------------------------------------------------------------------------------
// Tenant
// ------------------------------------------------------------------------------------------------

/// Isolation namespace of the index, written `<accountID>:<projectID>`.
///
/// Ordered numerically by `(account_id, project_id)`, which is also the
/// order of tenant key prefixes in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tenant {
    /// Account id.
    pub account_id: u32,
    /// Project id.
    pub project_id: u32,
}

impl Tenant {
    /// Creates a tenant.
    pub fn new(account_id: u32, project_id: u32) -> Self {
        Self {
            account_id,
            project_id,
        }
    }

    /// The tenant sorting right after this one, if any.
    pub fn next(self) -> Option<Tenant> {
        match self.project_id.checked_add(1) {
            Some(project_id) => Some(Tenant::new(self.account_id, project_id)),
            None => self
                .account_id
                .checked_add(1)
                .map(|account_id| Tenant::new(account_id, 0)),
        }
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.project_id)
    }
}

/// A tenant string that is not `<u32>:<u32>`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid tenant {input:?}: {reason}")]
pub struct ParseTenantError {
    /// The rejected input.
    pub input: String,
    /// What is wrong with it.
    pub reason: &'static str,
}

impl FromStr for Tenant {
    type Err = ParseTenantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseTenantError {
            input: s.to_string(),
            reason,
        };
        let (account, project) = s
            .split_once(':')
            .ok_or_else(|| err("expected <accountID>:<projectID>"))?;
        let account_id = account
            .parse()
            .map_err(|_| err("accountID is not a u32"))?;
        let project_id = project
            .parse()
            .map_err(|_| err("projectID is not a u32"))?;
        Ok(Tenant::new(account_id, project_id))
    }
}

// ------------------------------------------------------------------------------------------------
// TSID
// ------------------------------------------------------------------------------------------------

/// Time-series identifier.
///
/// Field order is the sort order and the marshalled byte order: every
/// field is stored big-endian, so comparing marshalled TSIDs bytewise
/// agrees with comparing the structs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tsid {
    /// Tenant account.
    pub account_id: u32,
    /// Tenant project.
    pub project_id: u32,
    /// Id shared by series with the same metric name.
    pub metric_group_id: u64,
    /// Routing hint.
    pub job_id: u32,
    /// Routing hint.
    pub instance_id: u32,
    /// Unique series id.
    pub metric_id: u64,
}

impl Tsid {
    /// Tenant this series belongs to.
    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.account_id, self.project_id)
    }

    /// Appends the 32-byte marshalled form to `dst`.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.account_id.to_be_bytes());
        dst.extend_from_slice(&self.project_id.to_be_bytes());
        dst.extend_from_slice(&self.metric_group_id.to_be_bytes());
        dst.extend_from_slice(&self.job_id.to_be_bytes());
        dst.extend_from_slice(&self.instance_id.to_be_bytes());
        dst.extend_from_slice(&self.metric_id.to_be_bytes());
    }

    /// Marshalled form as an array.
    pub fn to_bytes(&self) -> [u8; TSID_SIZE] {
        let mut buf = Vec::with_capacity(TSID_SIZE);
        self.marshal(&mut buf);
        let mut out = [0u8; TSID_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes a TSID from the front of `src`, returning the unread tail.
    pub fn unmarshal(src: &[u8]) -> Result<(Tsid, &[u8]), StorageError> {
        if src.len() < TSID_SIZE {
            return Err(StorageError::Corruption(format!(
                "TSID needs {TSID_SIZE} bytes, got {}",
                src.len()
            )));
        }
        let (head, tail) = src.split_at(TSID_SIZE);
        let mut raw = [0u8; TSID_SIZE];
        raw.copy_from_slice(head);
        Ok((Tsid::from_bytes(&raw), tail))
    }

    /// Decodes the marshalled form.
    pub fn from_bytes(raw: &[u8; TSID_SIZE]) -> Tsid {
        let u32_at = |off: usize| u32::from_be_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[off..off + 8]);
            u64::from_be_bytes(b)
        };
        Tsid {
            account_id: u32_at(0),
            project_id: u32_at(4),
            metric_group_id: u64_at(8),
            job_id: u32_at(16),
            instance_id: u32_at(20),
            metric_id: u64_at(24),
        }
    }

    /// Decodes exactly one TSID; leftover bytes are corruption.
    pub fn unmarshal_exact(src: &[u8]) -> Result<Tsid, StorageError> {
        let (tsid, tail) = Tsid::unmarshal(src)?;
        if !tail.is_empty() {
            return Err(StorageError::Corruption(format!(
                "{} unexpected bytes after TSID",
                tail.len()
            )));
        }
        Ok(tsid)
    }
}
