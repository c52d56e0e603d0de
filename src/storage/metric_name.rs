//! Metric names and exact-match tag filters.
//!
//! A metric name is marshalled as a sequence of tag values, each escaped
//! and terminated by [`TAG_SEPARATOR`]:
//!
//! ```text
//! value(metric_group) value(key1) value(value1) value(key2) value(value2) ...
//! ```
//!
//! Escaping: `0x00 → 0x00 '0'`, `0x01 → 0x00 '1'`, `0x02 → 0x00 '2'`. The
//! marshalled form therefore never contains a raw `0x01` except as a
//! separator, nor a raw `0x02`, which the index uses to split a name from
//! a trailing TSID.

use super::StorageError;

/// Escape byte.
pub const ESCAPE_CHAR: u8 = 0;
/// Terminates every marshalled tag value.
pub const TAG_SEPARATOR: u8 = 1;
/// Separates a marshalled name from the TSID that follows it.
pub const KV_SEPARATOR: u8 = 2;

/// Appends the escaped, terminated form of `src`.
pub fn marshal_tag_value(dst: &mut Vec<u8>, src: &[u8]) {
    for &b in src {
        match b {
            ESCAPE_CHAR => dst.extend_from_slice(&[ESCAPE_CHAR, b'0']),
            TAG_SEPARATOR => dst.extend_from_slice(&[ESCAPE_CHAR, b'1']),
            KV_SEPARATOR => dst.extend_from_slice(&[ESCAPE_CHAR, b'2']),
            _ => dst.push(b),
        }
    }
    dst.push(TAG_SEPARATOR);
}

/// Decodes one tag value from the front of `src`, returning it and the
/// unread tail.
pub fn unmarshal_tag_value(src: &[u8]) -> Result<(Vec<u8>, &[u8]), StorageError> {
    let end = src
        .iter()
        .position(|&b| b == TAG_SEPARATOR)
        .ok_or_else(|| StorageError::Corruption("tag value without separator".into()))?;

    let mut out = Vec::with_capacity(end);
    let mut i = 0;
    while i < end {
        if src[i] != ESCAPE_CHAR {
            out.push(src[i]);
            i += 1;
            continue;
        }
        let decoded = match src.get(i + 1) {
            Some(b'0') if i + 1 < end => ESCAPE_CHAR,
            Some(b'1') if i + 1 < end => TAG_SEPARATOR,
            Some(b'2') if i + 1 < end => KV_SEPARATOR,
            _ => {
                return Err(StorageError::Corruption(format!(
                    "invalid escape sequence at offset {i}"
                )));
            }
        };
        out.push(decoded);
        i += 2;
    }
    Ok((out, &src[end + 1..]))
}

/// One `key=value` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    /// Tag key. Empty for the metric group.
    pub key: Vec<u8>,
    /// Tag value.
    pub value: Vec<u8>,
}

impl Tag {
    /// Creates a tag.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Appends `value(key) value(value)`.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_tag_value(dst, &self.key);
        marshal_tag_value(dst, &self.value);
    }
}

/// Metric group plus tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MetricName {
    /// The metric name proper (`__name__`).
    pub metric_group: Vec<u8>,
    /// Tags, kept sorted by key.
    pub tags: Vec<Tag>,
}

impl MetricName {
    /// A metric name without tags.
    pub fn new(metric_group: impl Into<Vec<u8>>) -> Self {
        Self {
            metric_group: metric_group.into(),
            tags: Vec::new(),
        }
    }

    /// Adds a tag, keeping tags sorted.
    pub fn with_tag(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.tags.push(Tag::new(key, value));
        self.tags.sort();
        self
    }

    /// Every tag including the metric group as a tag with an empty key.
    pub fn all_tags(&self) -> impl Iterator<Item = Tag> + '_ {
        std::iter::once(Tag::new(Vec::new(), self.metric_group.clone())).chain(self.tags.iter().cloned())
    }

    /// Appends the marshalled name.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_tag_value(dst, &self.metric_group);
        for tag in &self.tags {
            tag.marshal(dst);
        }
    }

    /// Decodes a complete marshalled name.
    pub fn unmarshal(mut src: &[u8]) -> Result<Self, StorageError> {
        let (metric_group, tail) = unmarshal_tag_value(src)?;
        src = tail;
        let mut tags = Vec::new();
        while !src.is_empty() {
            let (key, tail) = unmarshal_tag_value(src)?;
            let (value, tail) = unmarshal_tag_value(tail)?;
            tags.push(Tag { key, value });
            src = tail;
        }
        Ok(Self { metric_group, tags })
    }
}

/// Exact-match filter on one tag. An empty key matches the metric name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    /// Tag key, empty for the metric name.
    pub key: Vec<u8>,
    /// Required value.
    pub value: Vec<u8>,
}

impl TagFilter {
    /// Filter on `key=value`.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Filter on the metric name.
    pub fn metric_name(name: impl Into<Vec<u8>>) -> Self {
        Self::new(Vec::new(), name)
    }
}
