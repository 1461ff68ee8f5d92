//! Represents an object (blob) stored in a container.

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Size and modification time of an object, as returned by `Attributes`.
///
/// A snapshot taken at call time; nothing is cached between calls.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// Size in bytes. For a static large object this is the total size of
    /// all referenced segments.
    pub size: u64,

    /// Timestamp when the object was last written.
    pub last_modified: DateTime<Utc>,
}

/// Backend view of a single object, returned by a stat call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object name, unique within its container.
    pub name: String,

    /// Size in bytes.
    pub bytes: u64,

    /// MD5 of the content for plain objects; for a static large object the
    /// MD5 of the concatenated segment ETags.
    pub etag: String,

    /// Timestamp when the object was last written.
    pub last_modified: DateTime<Utc>,

    /// Whether the object is a static large object manifest.
    pub static_large_object: bool,
}

impl From<&ObjectInfo> for ObjectAttributes {
    fn from(info: &ObjectInfo) -> Self {
        Self {
            size: info.bytes,
            last_modified: info.last_modified,
        }
    }
}

/// A byte range `[offset, offset + length)`; `length: None` reads to the end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    /// Build a range from the signed convention of the object-store contract,
    /// where `length == -1` means "until end of object".
    pub fn from_signed(offset: i64, length: i64) -> Result<Self> {
        if offset < 0 {
            return Err(Error::invalid_argument(format!(
                "range offset must not be negative, got {offset}"
            )));
        }
        let length = match length {
            -1 => None,
            len if len < 0 => {
                return Err(Error::invalid_argument(format!(
                    "range length must be -1 or non-negative, got {len}"
                )));
            }
            len => Some(len as u64),
        };
        Ok(Self {
            offset: offset as u64,
            length,
        })
    }

    /// Value for an HTTP `Range` header. Must not be called for an empty range.
    pub fn header_value(&self) -> String {
        match self.length {
            Some(len) => format!("bytes={}-{}", self.offset, self.offset + len - 1),
            None => format!("bytes={}-", self.offset),
        }
    }

    /// Parse a single-range `bytes=a-b` / `bytes=a-` header.
    pub fn parse_header(value: &str) -> Option<Self> {
        let ranges = value.trim().strip_prefix("bytes=")?;
        if ranges.contains(',') {
            return None;
        }
        let (start, end) = ranges.split_once('-')?;
        let offset = start.trim().parse::<u64>().ok()?;
        let end = end.trim();
        if end.is_empty() {
            return Some(Self {
                offset,
                length: None,
            });
        }
        let last = end.parse::<u64>().ok()?;
        if last < offset {
            return None;
        }
        Some(Self {
            offset,
            length: Some(last - offset + 1),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.length == Some(0)
    }

    /// Clamp this range against an object of `size` bytes, returning the
    /// `(start, end)` byte offsets. `None` when the range is not satisfiable.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if self.offset >= size {
            return None;
        }
        let end = match self.length {
            Some(len) => self.offset.saturating_add(len).min(size),
            None => size,
        };
        Some((self.offset, end))
    }
}
