//! The authenticated connection: the capability set the container handle
//! needs from a storage endpoint.
//!
//! Three implementations ship with the crate:
//! - [`swift::SwiftConnection`] talks HTTP to a real Swift endpoint,
//! - [`local::LocalConnection`] keeps metadata in SQLite and payloads on disk,
//! - [`memory::MemoryConnection`] is an in-memory fake with fault injection.

pub mod local;
pub mod memory;
pub mod swift;

use crate::{
    errors::Result,
    models::{ByteRange, Manifest, ObjectInfo},
    payload::ByteStream,
};
use async_trait::async_trait;

pub use local::LocalConnection;
pub use memory::MemoryConnection;
pub use swift::SwiftConnection;

/// Page size used when a listing does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 10_000;

/// An opened object body.
pub struct ObjectBody {
    pub stream: ByteStream,
    /// ETag as reported by the backend, unquoted.
    pub etag: Option<String>,
    pub static_large_object: bool,
}

/// Parameters of a single listing page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOpts {
    pub prefix: String,
    /// When set, names with a further delimiter after `prefix` are folded
    /// into one `prefix/dir/` entry.
    pub delimiter: Option<char>,
    /// Only entries strictly greater than `marker` are returned.
    pub marker: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn container_exists(&self, container: &str) -> Result<bool>;

    async fn container_create(&self, container: &str) -> Result<()>;

    /// Fails with a 409 backend error when the container still holds objects.
    async fn container_delete(&self, container: &str) -> Result<()>;

    /// Open an object for reading, optionally restricted to a byte range.
    /// Manifests are resolved into the concatenation of their segments.
    async fn object_open(
        &self,
        container: &str,
        name: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectBody>;

    async fn object_stat(&self, container: &str, name: &str) -> Result<ObjectInfo>;

    /// Write `body` as the full content of `name`, replacing any previous
    /// version. Returns the ETag the backend computed.
    async fn object_put(
        &self,
        container: &str,
        name: &str,
        body: ByteStream,
        content_length: Option<u64>,
    ) -> Result<String>;

    /// Commit a static large object manifest under `name`. Every referenced
    /// segment must already exist with the recorded ETag and size.
    async fn manifest_put(&self, container: &str, name: &str, manifest: &Manifest) -> Result<()>;

    /// The manifest stored under `name`, or `None` for a plain object.
    async fn manifest_get(&self, container: &str, name: &str) -> Result<Option<Manifest>>;

    /// Remove a single object. Does not follow manifests.
    async fn object_delete(&self, container: &str, name: &str) -> Result<()>;

    /// One page of a name listing, in backend order.
    async fn object_names(&self, container: &str, opts: &ListOpts) -> Result<Vec<String>>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Folds a name that continues past `prefix` with a delimiter into its
/// directory entry (`prefix` + first path segment + delimiter).
pub(crate) fn common_prefix(name: &str, prefix: &str, delimiter: char) -> Option<String> {
    let rest = name.strip_prefix(prefix)?;
    let pos = rest.find(delimiter)?;
    let mut dir = String::with_capacity(prefix.len() + pos + 1);
    dir.push_str(prefix);
    dir.push_str(&rest[..pos + delimiter.len_utf8()]);
    Some(dir)
}

/// Builds one listing page from names fed in ascending order.
pub(crate) struct ListingPage<'a> {
    opts: &'a ListOpts,
    limit: usize,
    entries: Vec<String>,
}

impl<'a> ListingPage<'a> {
    pub(crate) fn new(opts: &'a ListOpts) -> Self {
        Self {
            opts,
            limit: opts.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1),
            entries: Vec::new(),
        }
    }

    /// Offer the next name; returns `false` once the page is full.
    pub(crate) fn offer(&mut self, name: &str) -> bool {
        if self.is_full() {
            return false;
        }
        if !name.starts_with(&self.opts.prefix) {
            return true;
        }
        let entry = match self.opts.delimiter {
            Some(delim) => {
                common_prefix(name, &self.opts.prefix, delim).unwrap_or_else(|| name.to_string())
            }
            None => name.to_string(),
        };
        if let Some(marker) = &self.opts.marker {
            if entry.as_str() <= marker.as_str() {
                return true;
            }
        }
        if self.entries.last() != Some(&entry) {
            self.entries.push(entry);
        }
        !self.is_full()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    pub(crate) fn finish(self) -> Vec<String> {
        self.entries
    }
}
