//! Container handle: the object-store contract over one Swift container.

use super::upload::{UploadEngine, UploadReport};
use crate::{
    checksum::VerifyingStream,
    config::SwiftConfig,
    connection::{Connection, DEFAULT_LIST_LIMIT, ListOpts, SwiftConnection},
    errors::{Error, ErrorKind, Result, WrapErr},
    models::{ByteRange, ObjectAttributes},
    payload::{ByteStream, Payload},
};
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DELIMITER: char = '/';

/// Names and thresholds fixed when a [`Container`] is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSettings {
    name: String,
    segments_name: String,
    chunk_size: u64,
}

impl ContainerSettings {
    /// An empty `segments_name` means segments live in `name` itself.
    pub fn new(name: String, segments_name: String, chunk_size: u64) -> Self {
        let segments_name = if segments_name.is_empty() {
            name.clone()
        } else {
            segments_name
        };
        Self {
            name,
            segments_name,
            chunk_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segments_container(&self) -> &str {
        &self.segments_name
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

/// Make sure `container` exists, creating it when allowed.
pub async fn ensure_container(
    conn: &dyn Connection,
    container: &str,
    create_if_absent: bool,
) -> Result<()> {
    if conn.container_exists(container).await? {
        return Ok(());
    }
    if !create_if_absent {
        return Err(Error::ContainerNotFound(container.to_string()));
    }
    match conn.container_create(container).await {
        Ok(()) => {
            info!(container, "created container");
            Ok(())
        }
        Err(err) if matches!(err.kind(), ErrorKind::Canceled | ErrorKind::DeadlineExceeded) => {
            Err(err)
        }
        Err(err) => Err(Error::CreateFailed {
            container: container.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// `""` stays the root. Otherwise one trailing delimiter is dropped and
/// exactly one appended, so `a//` still names the `a//` directory.
pub fn normalize_prefix(dir: &str) -> String {
    if dir.is_empty() {
        return String::new();
    }
    let trimmed = dir.strip_suffix(DELIMITER).unwrap_or(dir);
    format!("{trimmed}{DELIMITER}")
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        Err(Error::invalid_argument("object name cannot be empty"))
    } else {
        Ok(())
    }
}

/// A container bound to a connection. Cheap to clone; clones share the
/// connection and carry no mutable state.
#[derive(Clone)]
pub struct Container {
    conn: Arc<dyn Connection>,
    settings: ContainerSettings,
    list_limit: usize,
}

impl Container {
    /// Bind `settings` to `conn`, ensuring the container and (when distinct)
    /// the segment container exist.
    pub async fn open(
        conn: Arc<dyn Connection>,
        settings: ContainerSettings,
        create_if_absent: bool,
    ) -> Result<Self> {
        if settings.name().is_empty() {
            return Err(Error::Config("container name is required".into()));
        }
        if settings.chunk_size() == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        ensure_container(conn.as_ref(), settings.name(), create_if_absent).await?;
        if settings.segments_container() != settings.name() {
            ensure_container(conn.as_ref(), settings.segments_container(), create_if_absent)
                .await?;
        }
        Ok(Self {
            conn,
            settings,
            list_limit: DEFAULT_LIST_LIMIT,
        })
    }

    /// Authenticate against Swift with `cfg` and open its container.
    pub async fn from_config(cfg: &SwiftConfig, create_if_absent: bool) -> Result<Self> {
        cfg.validate()?;
        let conn = SwiftConnection::connect(cfg.connect_options()?).await?;
        Self::open(Arc::new(conn), cfg.container_settings(), create_if_absent).await
    }

    pub async fn from_yaml(yaml: &str, create_if_absent: bool) -> Result<Self> {
        Self::from_config(&SwiftConfig::parse(yaml)?, create_if_absent).await
    }

    /// Page size requested from the backend while iterating.
    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    pub fn name(&self) -> &str {
        self.settings.name()
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Full content of `name`. Plain objects are checked against their MD5
    /// as they stream; a mismatch ends the stream with an `InvalidData` error.
    pub async fn get(&self, name: &str) -> Result<ByteStream> {
        check_name(name)?;
        let body = self
            .conn
            .object_open(self.name(), name, None)
            .await
            .wrap_err_with(|| format!("get {}/{}", self.name(), name))?;
        match body.etag {
            Some(etag) if !body.static_large_object && !etag.is_empty() => {
                Ok(VerifyingStream::new(body.stream, &etag, name).boxed())
            }
            _ => Ok(body.stream),
        }
    }

    /// `length` bytes starting at `offset`; `length == -1` reads to the end.
    /// Reading to the end from `offset == size` yields an empty stream.
    pub async fn get_range(&self, name: &str, offset: i64, length: i64) -> Result<ByteStream> {
        check_name(name)?;
        let range = ByteRange::from_signed(offset, length)?;
        if range.is_empty() {
            self.attributes(name).await?;
            return Ok(stream::empty().boxed());
        }
        let ctx = || {
            format!(
                "get {}/{} range {}",
                self.name(),
                name,
                range.header_value()
            )
        };
        match self.conn.object_open(self.name(), name, Some(range)).await {
            Ok(body) => Ok(body.stream),
            // Swift answers 416 for an open range starting at the end.
            Err(err) if err.status() == Some(416) && range.length.is_none() => {
                let attrs = self.attributes(name).await?;
                if attrs.size == range.offset {
                    Ok(stream::empty().boxed())
                } else {
                    Err(err.context(ctx()))
                }
            }
            Err(err) => Err(err.context(ctx())),
        }
    }

    pub async fn attributes(&self, name: &str) -> Result<ObjectAttributes> {
        check_name(name)?;
        let info = self
            .conn
            .object_stat(self.name(), name)
            .await
            .wrap_err_with(|| format!("stat {}/{}", self.name(), name))?;
        Ok(ObjectAttributes::from(&info))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        match self.attributes(name).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Call `visit` for each entry directly under `dir`: objects by full
    /// name, sub-directories once as `dir/sub/`.
    pub async fn iter<F>(&self, dir: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&str) -> anyhow::Result<()> + Send,
    {
        let prefix = normalize_prefix(dir);
        let mut marker: Option<String> = None;
        loop {
            let opts = ListOpts {
                prefix: prefix.clone(),
                delimiter: Some(DELIMITER),
                marker: marker.clone(),
                limit: Some(self.list_limit),
            };
            let page = self
                .conn
                .object_names(self.name(), &opts)
                .await
                .wrap_err_with(|| format!("iterate {}/{}", self.name(), prefix))?;
            let Some(last) = page.last().cloned() else {
                return Ok(());
            };
            if let Some(m) = marker.as_deref().filter(|m| last.as_str() <= *m) {
                warn!(container = self.name(), %last, marker = m, "listing did not advance");
                return Err(Error::backend(format!(
                    "iterate {}/{}: listing did not advance past `{}`",
                    self.name(),
                    prefix,
                    m
                )));
            }
            debug!(container = self.name(), %prefix, entries = page.len(), "listing page");
            for entry in &page {
                visit(entry).map_err(|source| Error::Visit {
                    context: format!("iterate {}/{}: visit {}", self.name(), prefix, entry),
                    source,
                })?;
            }
            marker = Some(last);
        }
    }

    /// Write `payload` as `name`; see [`UploadEngine`].
    pub async fn upload(&self, name: &str, payload: Payload) -> Result<UploadReport> {
        UploadEngine::new(self.conn.as_ref(), &self.settings)
            .run(name, payload)
            .await
    }

    /// Delete `name`; for a static large object also every segment it
    /// references. The manifest goes first so readers stop seeing the object.
    pub async fn delete(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let ctx = || format!("delete {}/{}", self.name(), name);
        let info = self
            .conn
            .object_stat(self.name(), name)
            .await
            .wrap_err_with(ctx)?;
        let manifest = if info.static_large_object {
            self.conn
                .manifest_get(self.name(), name)
                .await
                .wrap_err_with(ctx)?
        } else {
            None
        };
        self.conn
            .object_delete(self.name(), name)
            .await
            .wrap_err_with(ctx)?;

        let Some(manifest) = manifest else {
            return Ok(());
        };
        let mut first_err = None;
        for segment in &manifest.segments {
            match self
                .conn
                .object_delete(&segment.container, &segment.name)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(segment = %segment.path(), "segment already gone");
                }
                Err(err) => {
                    warn!(segment = %segment.path(), error = %err, "failed to delete segment");
                    first_err.get_or_insert(err.context(format!(
                        "{}: segment {}",
                        ctx(),
                        segment.path()
                    )));
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Nothing to release; the connection outlives the handle.
    pub async fn close(&self) -> Result<()> {
        Ok(())
    }
}
