//! Binary encoding of the on-disk metadata: part headers, footers and
//! block indexes, the parts manifest and block-header chunks.
//!
//! # Wire format
//!
//! | Rust type         | Encoding                          |
//! |-------------------|-----------------------------------|
//! | `u32`             | 4 bytes, little-endian            |
//! | `u64`, `i64`      | 8 bytes, little-endian            |
//! | `[u8; N]`         | `N` raw bytes                     |
//! | `[u8]`, `Vec<u8>` | `[u32 len][bytes]`                |
//! | `Vec<T>`          | `[u32 count][T][T]...`            |
//!
//! Index *items* never go through this module. Their integers are
//! big-endian so that byte order equals numeric order (see
//! [`crate::storage::keys`]).
//!
//! Decoders reject byte lengths above [`MAX_BYTE_LEN`] and element counts
//! above [`MAX_VEC_ELEMENTS`] before allocating.
//!
//! Struct decoders walk their input with a [`Reader`]:
//!
//! ```rust,ignore
//! let mut r = Reader::new(buf);
//! let offset = r.read::<u64>()?;
//! let size = r.read::<u64>()?;
//! Ok((BlockHandle { offset, size }, r.consumed()))
//! ```


use thiserror::Error;

/// Maximum byte length of one length-prefixed field (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Maximum element count of a decoded `Vec<T>` (16 M).
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A version or discriminant field held an unknown value.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The value that was read.
        tag: u32,
        /// What was being decoded.
        type_name: &'static str,
    },

    /// A length or count exceeded its limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer. Equal values encode to equal bytes.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a byte slice, returning
/// `(value, bytes_consumed)`.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a freshly allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`, returning `(value, consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        return Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

#[inline]
fn take_array<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    require(buf, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    Ok(arr)
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Sequential decoder over one buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at `buf[0]`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Decodes the next field.
    pub fn read<T: Decode>(&mut self) -> Result<T, EncodingError> {
        let (value, n) = T::decode_from(&self.buf[self.offset..])?;
        self.offset += n;
        Ok(value)
    }

    /// Decodes the next `[u32 count][T]...` field.
    pub fn read_vec<T: Decode>(&mut self) -> Result<Vec<T>, EncodingError> {
        let (items, n) = decode_vec(&self.buf[self.offset..])?;
        self.offset += n;
        Ok(items)
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }
}

// ------------------------------------------------------------------------------------------------
// Integers
// ------------------------------------------------------------------------------------------------

macro_rules! le_int {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            #[inline]
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                buf.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                const N: usize = std::mem::size_of::<$ty>();
                Ok((<$ty>::from_le_bytes(take_array::<N>(buf)?), N))
            }
        }
    )*};
}

le_int!(u32, u64, i64);

// ------------------------------------------------------------------------------------------------
// Byte fields
// ------------------------------------------------------------------------------------------------

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((take_array(buf)?, N))
    }
}

impl Encode for [u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

/// Borrows a `[u32 len][bytes]` field without copying it.
///
/// Returns `(bytes, consumed)`. The part cursor decodes items straight out
/// of the memory map with this.
pub fn decode_bytes(buf: &[u8]) -> Result<(&[u8], usize), EncodingError> {
    let (len, offset) = u32::decode_from(buf)?;
    if len > MAX_BYTE_LEN {
        return Err(EncodingError::LengthOverflow(format!(
            "byte length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
        )));
    }
    let len = len as usize;
    require(&buf[offset..], len)?;
    Ok((&buf[offset..offset + len], offset + len))
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, consumed) = decode_bytes(buf)?;
        Ok((bytes.to_vec(), consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Sequences
// ------------------------------------------------------------------------------------------------

/// Encode a slice of `T` as `[u32 count][T][T]...`.
///
/// `Vec<u8>` already encodes as a byte field, so sequences of other types
/// go through this function rather than a blanket impl.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a `Vec<T>` from `[u32 count][T][T]...`, capped at
/// [`MAX_VEC_ELEMENTS`].
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut offset) = u32::decode_from(buf)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "element count {count} exceeds MAX_VEC_ELEMENTS ({MAX_VEC_ELEMENTS})"
        )));
    }
    let mut items = Vec::with_capacity((count as usize).min(buf.len() / 4 + 1));
    for _ in 0..count {
        let (item, consumed) = T::decode_from(&buf[offset..])?;
        offset += consumed;
        items.push(item);
    }
    Ok((items, offset))
}
