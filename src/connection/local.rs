//! src/connection/local.rs
//!
//! LocalConnection - a Swift-like backend with container and object metadata
//! in SQLite and object payloads on local disk, sharded beneath
//! `base_path/{container}/{shard}/{shard}/{write-id}`.
//!
//! Every write lands in a fresh file named by a per-write UUID and only
//! becomes visible when its metadata row commits, so a reader never sees a
//! half-written payload. Static large object manifests are stored as JSON in
//! the object row and resolved into their segment files at read time.

use super::{Connection, ListOpts, ListingPage, ObjectBody};
use crate::{
    errors::{Error, Result},
    models::{ByteRange, Manifest, ObjectInfo},
    payload::ByteStream,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use md5::Context;
use sqlx::{
    FromRow, QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_NAME_LEN: usize = 1024;
const MAX_CONTAINER_NAME_LEN: usize = 256;

#[derive(Debug, FromRow)]
struct ObjectRow {
    id: Uuid,
    name: String,
    size_bytes: i64,
    etag: String,
    last_modified: DateTime<Utc>,
    manifest: Option<String>,
}

impl ObjectRow {
    fn info(&self) -> ObjectInfo {
        ObjectInfo {
            name: self.name.clone(),
            bytes: self.size_bytes.max(0) as u64,
            etag: self.etag.clone(),
            last_modified: self.last_modified,
            static_large_object: self.manifest.is_some(),
        }
    }

    fn manifest(&self) -> Result<Option<Manifest>> {
        self.manifest
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<Manifest>(raw).map_err(|err| {
                    Error::backend(format!("corrupt manifest for `{}`: {err}", self.name))
                })
            })
            .transpose()
    }
}

/// A contiguous slice of one payload file.
struct Part {
    path: PathBuf,
    skip: u64,
    take: u64,
}

#[derive(Clone)]
pub struct LocalConnection {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

fn db_err(err: sqlx::Error) -> Error {
    Error::backend(format!("sqlite: {err}"))
}

fn disk_err(err: io::Error) -> Error {
    Error::backend(format!("disk: {err}"))
}

impl LocalConnection {
    /// Backend over an existing pool. The schema must already be migrated.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Open (creating if needed) the database at `database_url`, apply the
    /// schema and use `base_path` for payloads.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let conn = Self::new(Arc::new(pool), base_path);
        fs::create_dir_all(&conn.base_path).await.map_err(disk_err)?;
        conn.migrate().await?;
        Ok(conn)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.db)
            .await
            .map_err(|err| Error::backend(format!("sqlite migration: {err}")))
    }

    /// Rejects names the backend cannot store.
    fn ensure_name_safe(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("object name cannot be empty"));
        }
        if name.len() > MAX_OBJECT_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "object name longer than {MAX_OBJECT_NAME_LEN} bytes"
            )));
        }
        if name.bytes().any(|b| b == b'\0') {
            return Err(Error::invalid_argument("object name contains NUL"));
        }
        Ok(())
    }

    /// Container names become directory names, so they must be a single
    /// path component.
    fn ensure_container_name_safe(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_CONTAINER_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "container name must be 1-{MAX_CONTAINER_NAME_LEN} bytes"
            )));
        }
        if name == "." || name == ".." {
            return Err(Error::invalid_argument("container name cannot be . or .."));
        }
        if name
            .bytes()
            .any(|b| b == b'/' || b == b'\\' || b.is_ascii_control())
        {
            return Err(Error::invalid_argument(format!(
                "container name `{name}` contains a path separator or control character"
            )));
        }
        Ok(())
    }

    fn container_root(&self, container: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(container);
        path
    }

    /// Two-level shard directories from MD5(container/name), 00–ff each.
    fn object_shards(container: &str, name: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, name));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn payload_path(&self, container: &str, name: &str, id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, name);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.simple().to_string());
        path
    }

    async fn ensure_container(&self, container: &str) -> Result<()> {
        if self.container_exists(container).await? {
            Ok(())
        } else {
            Err(Error::ContainerNotFound(container.to_string()))
        }
    }

    async fn fetch_object(&self, container: &str, name: &str) -> Result<ObjectRow> {
        sqlx::query_as::<_, ObjectRow>(
            "SELECT id, name, size_bytes, etag, last_modified, manifest
             FROM objects WHERE container = ? AND name = ?",
        )
        .bind(container)
        .bind(name)
        .fetch_optional(&*self.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::object_not_found(container, name))
    }

    /// Replace the row for `name` in one transaction, then drop the payload
    /// of the version it replaced.
    ///
    /// The old row is taken out with `DELETE ... RETURNING` so the
    /// transaction writes first; of two concurrent writers exactly one sees
    /// each replaced version.
    async fn commit_row(
        &self,
        container: &str,
        name: &str,
        id: Uuid,
        size_bytes: i64,
        etag: &str,
        manifest: Option<String>,
    ) -> Result<()> {
        let mut tx = self.db.begin().await.map_err(db_err)?;

        let previous: Option<(Uuid, Option<String>)> = sqlx::query_as(
            "DELETE FROM objects WHERE container = ? AND name = ? RETURNING id, manifest",
        )
        .bind(container)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO objects (id, container, name, size_bytes, etag, last_modified, manifest)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(container)
        .bind(name)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .bind(manifest)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        if let Some((old_id, None)) = previous {
            self.remove_payload(container, name, old_id).await;
        }
        Ok(())
    }

    async fn remove_payload(&self, container: &str, name: &str, id: Uuid) {
        let file_path = self.payload_path(container, name, id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload file {} already missing", file_path.display());
            }
            Err(err) => debug!("failed to remove {}: {}", file_path.display(), err),
        }
        if let Some(parent) = file_path.parent() {
            let root = self.container_root(container);
            self.prune_empty_dirs(parent, &root).await;
        }
    }

    /// Payload parts covering `range` of the object stored in `row`.
    async fn parts_for(
        &self,
        container: &str,
        row: &ObjectRow,
        range: Option<ByteRange>,
    ) -> Result<Vec<Part>> {
        let mut files = Vec::new();
        match row.manifest()? {
            Some(manifest) => {
                for segment in &manifest.segments {
                    let seg_row = self
                        .fetch_object(&segment.container, &segment.name)
                        .await
                        .map_err(|_| {
                            Error::backend_status(
                                409,
                                format!("manifest segment {} is missing", segment.path()),
                            )
                        })?;
                    files.push((
                        self.payload_path(&segment.container, &segment.name, seg_row.id),
                        seg_row.size_bytes.max(0) as u64,
                    ));
                }
            }
            None => files.push((
                self.payload_path(container, &row.name, row.id),
                row.size_bytes.max(0) as u64,
            )),
        }

        let total: u64 = files.iter().map(|(_, size)| size).sum();
        let (start, end) = match range {
            Some(range) => range.resolve(total).ok_or_else(|| {
                Error::backend_status(416, format!("range {range:?} not satisfiable"))
            })?,
            None => (0, total),
        };

        let mut parts = Vec::new();
        let mut offset = 0u64;
        for (path, size) in files {
            let lo = start.max(offset);
            let hi = end.min(offset + size);
            if lo < hi {
                parts.push(Part {
                    path,
                    skip: lo - offset,
                    take: hi - lo,
                });
            }
            offset += size;
        }
        Ok(parts)
    }

    /// Recursively remove empty directories up to the container root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn container_exists(&self, container: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM containers WHERE name = ?")
            .bind(container)
            .fetch_optional(&*self.db)
            .await
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn container_create(&self, container: &str) -> Result<()> {
        self.ensure_container_name_safe(container)?;
        fs::create_dir_all(self.container_root(container))
            .await
            .map_err(disk_err)?;
        sqlx::query("INSERT OR IGNORE INTO containers (name, created_at) VALUES (?, ?)")
            .bind(container)
            .bind(Utc::now())
            .execute(&*self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Removes the metadata row, then the container directory best-effort.
    async fn container_delete(&self, container: &str) -> Result<()> {
        self.ensure_container(container).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE container = ?")
            .bind(container)
            .fetch_one(&*self.db)
            .await
            .map_err(db_err)?;
        if count > 0 {
            return Err(Error::backend_status(
                409,
                format!("container `{container}` is not empty"),
            ));
        }

        sqlx::query("DELETE FROM containers WHERE name = ?")
            .bind(container)
            .execute(&*self.db)
            .await
            .map_err(db_err)?;

        let root = self.container_root(container);
        if let Err(err) = fs::remove_dir_all(&root).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove container directory {} after delete: {}",
                    root.display(),
                    err
                );
            }
        }
        Ok(())
    }

    async fn object_open(
        &self,
        container: &str,
        name: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectBody> {
        self.ensure_name_safe(name)?;
        let row = self.fetch_object(container, name).await?;
        let parts = self.parts_for(container, &row, range).await?;
        if row.manifest.is_none() {
            if let Some(part) = parts.first() {
                fs::metadata(&part.path).await.map_err(|err| {
                    if err.kind() == ErrorKind::NotFound {
                        Error::object_not_found(container, name)
                    } else {
                        disk_err(err)
                    }
                })?;
            }
        }

        let stream = stream::iter(parts)
            .then(|part| async move {
                let mut file = File::open(&part.path).await?;
                file.seek(SeekFrom::Start(part.skip)).await?;
                Ok::<_, io::Error>(ReaderStream::new(file.take(part.take)))
            })
            .try_flatten()
            .boxed();

        Ok(ObjectBody {
            stream,
            etag: Some(row.etag.clone()),
            static_large_object: row.manifest.is_some(),
        })
    }

    async fn object_stat(&self, container: &str, name: &str) -> Result<ObjectInfo> {
        self.ensure_name_safe(name)?;
        Ok(self.fetch_object(container, name).await?.info())
    }

    /// Stream-upload an object to disk and commit its metadata.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Renames into a fresh payload path, then upserts the row.
    ///
    /// Cleans up the temp file on every error path.
    async fn object_put(
        &self,
        container: &str,
        name: &str,
        mut body: ByteStream,
        _content_length: Option<u64>,
    ) -> Result<String> {
        self.ensure_name_safe(name)?;
        self.ensure_container(container).await?;

        let id = Uuid::new_v4();
        let file_path = self.payload_path(container, name, id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            Error::backend("payload path missing parent directory")
        })?;
        fs::create_dir_all(&parent).await.map_err(disk_err)?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await.map_err(disk_err)?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(Error::backend(format!(
                        "reading request body for `{name}`: {err}"
                    )));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(disk_err(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(disk_err(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(disk_err(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(disk_err(err));
        }

        let etag = format!("{:x}", digest.compute());
        if let Err(err) = self
            .commit_row(container, name, id, size_bytes, &etag, None)
            .await
        {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }
        debug!(
            "stored {}/{} ({} bytes, etag {})",
            container, name, size_bytes, etag
        );
        Ok(etag)
    }

    async fn manifest_put(&self, container: &str, name: &str, manifest: &Manifest) -> Result<()> {
        self.ensure_name_safe(name)?;
        self.ensure_container(container).await?;
        for segment in &manifest.segments {
            match self.fetch_object(&segment.container, &segment.name).await {
                Ok(row)
                    if row.etag == segment.etag
                        && row.size_bytes.max(0) as u64 == segment.size_bytes => {}
                Ok(_) => {
                    return Err(Error::backend_status(
                        400,
                        format!("segment {} does not match manifest", segment.path()),
                    ));
                }
                Err(err) if err.is_not_found() => {
                    return Err(Error::backend_status(
                        400,
                        format!("segment {} does not exist", segment.path()),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
        let raw = serde_json::to_string(manifest)
            .map_err(|err| Error::backend(format!("encode manifest: {err}")))?;
        self.commit_row(
            container,
            name,
            Uuid::new_v4(),
            manifest.total_size() as i64,
            &manifest.etag(),
            Some(raw),
        )
        .await
    }

    async fn manifest_get(&self, container: &str, name: &str) -> Result<Option<Manifest>> {
        self.ensure_name_safe(name)?;
        self.fetch_object(container, name).await?.manifest()
    }

    async fn object_delete(&self, container: &str, name: &str) -> Result<()> {
        self.ensure_name_safe(name)?;
        let row = self.fetch_object(container, name).await?;

        let result = sqlx::query("DELETE FROM objects WHERE container = ? AND name = ? AND id = ?")
            .bind(container)
            .bind(name)
            .bind(row.id)
            .execute(&*self.db)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::object_not_found(container, name));
        }

        if row.manifest.is_none() {
            self.remove_payload(container, name, row.id).await;
        }
        Ok(())
    }

    async fn object_names(&self, container: &str, opts: &ListOpts) -> Result<Vec<String>> {
        self.ensure_container(container).await?;

        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT name FROM objects WHERE container = ");
        builder.push_bind(container);
        if !opts.prefix.is_empty() {
            builder.push(" AND substr(name, 1, ");
            builder.push_bind(opts.prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(opts.prefix.as_str());
        }
        if let Some(marker) = &opts.marker {
            builder.push(" AND name > ");
            builder.push_bind(marker.as_str());
        }
        builder.push(" ORDER BY name ASC");

        let query = builder.build_query_scalar::<String>();
        let mut rows = query.fetch(&*self.db);
        let mut page = ListingPage::new(opts);
        while let Some(name) = rows.try_next().await.map_err(db_err)? {
            if !page.offer(&name) {
                break;
            }
        }
        Ok(page.finish())
    }

    /// Runs a trivial query and a write/read/delete probe under `base_path`.
    async fn health_check(&self) -> Result<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&*self.db)
            .await
            .map_err(db_err)?;
        if one != 1 {
            return Err(Error::backend(format!("sqlite: unexpected result {one}")));
        }

        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await.map_err(disk_err)?;
        let read = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        match read {
            Ok(bytes) if bytes == b"readyz" => Ok(()),
            Ok(_) => Err(Error::backend("disk: probe content mismatch")),
            Err(err) => Err(disk_err(err)),
        }
    }
}
