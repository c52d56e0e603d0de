//! Structural order check for a part.
//!
//! For every leading byte `b` in `0..=255`, seeking to the one-byte key
//! `[b]` must yield either nothing or an item whose first byte is `>= b`.
//! A violation means the part is corrupted or was built from badly
//! constructed keys, and lookups into some namespace would be misrouted.
//!
//! The check performs exactly 256 seeks regardless of part size and never
//! mutates the part.

use tracing::debug;

use super::{Part, PartError};

/// Validates the leading-byte order invariant of `part`.
///
/// # Errors
///
/// - [`PartError::OrderViolation`] when a seek returns a smaller leading
///   byte.
/// - Any error the cursor hit while reading (checksum, decoding), which is
///   distinct from ordinary exhaustion.
pub fn validate_order(part: &Part) -> Result<(), PartError> {
    let mut ps = part.search();

    for b in 0..=u8::MAX {
        ps.seek(&[b]);
        if ps.next_item() {
            let found = ps.item().first().copied().unwrap_or(0);
            if found < b {
                return Err(PartError::OrderViolation {
                    path: part.path().to_path_buf(),
                    sought: b,
                    found,
                });
            }
        }
        if let Some(err) = ps.take_error() {
            return Err(err);
        }
    }

    debug!(path = ?part.path(), items = part.items_count(), "part order validated");
    Ok(())
}
