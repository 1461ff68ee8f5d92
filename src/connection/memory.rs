//! In-memory connection used by tests and examples.
//!
//! Behaves like a Swift cluster with perfect consistency: containers, plain
//! objects, static large object manifests resolved at read time, paginated
//! delimiter listings. Faults can be injected to exercise error paths.

use super::{Connection, ListOpts, ListingPage, ObjectBody};
use crate::{
    checksum::md5_hex,
    errors::{Error, Result},
    models::{ByteRange, Manifest, ObjectInfo},
    payload::ByteStream,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
    manifest: Option<Manifest>,
}

impl StoredObject {
    fn size(&self) -> u64 {
        match &self.manifest {
            Some(m) => m.total_size(),
            None => self.data.len() as u64,
        }
    }
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, BTreeMap<String, StoredObject>>,
}

#[derive(Default)]
struct Faults {
    /// Number of `object_put` calls that succeed before every further one fails.
    puts_before_failure: Option<usize>,
    fail_manifest_put: bool,
    fail_container_create: bool,
    /// Server-side cap on listing page size.
    page_cap: Option<usize>,
    /// Serve every listing page as if no marker had been sent.
    stale_listing: bool,
    latency: Option<Duration>,
}

/// Cheaply cloneable handle; clones share the same store.
#[derive(Clone, Default)]
pub struct MemoryConnection {
    state: Arc<Mutex<State>>,
    faults: Arc<Mutex<Faults>>,
    puts: Arc<AtomicUsize>,
    list_calls: Arc<AtomicUsize>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with the given empty containers.
    pub fn with_containers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let conn = Self::new();
        {
            let mut state = conn.state();
            for name in names {
                state.containers.entry(name.into()).or_default();
            }
        }
        conn
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Let `n` more object writes succeed, then fail every later one.
    pub fn fail_puts_after(&self, n: usize) {
        let done = self.puts.load(Ordering::SeqCst);
        self.faults().puts_before_failure = Some(done + n);
    }

    pub fn fail_manifest_put(&self, fail: bool) {
        self.faults().fail_manifest_put = fail;
    }

    pub fn fail_container_create(&self, fail: bool) {
        self.faults().fail_container_create = fail;
    }

    /// Never return more than `cap` entries per listing page.
    pub fn cap_page_size(&self, cap: usize) {
        self.faults().page_cap = Some(cap.max(1));
    }

    /// Ignore the marker of listing requests, so pagination never advances.
    pub fn stale_listing(&self, stale: bool) {
        self.faults().stale_listing = stale;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults().latency = Some(latency);
    }

    pub fn clear_faults(&self) {
        *self.faults() = Faults::default();
    }

    /// How many listing pages have been served.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// All object names in a container, sorted.
    pub fn object_names_in(&self, container: &str) -> Vec<String> {
        self.state()
            .containers
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the stored bytes without touching the recorded ETag, as bit
    /// rot on the backend would.
    pub fn corrupt(&self, container: &str, name: &str, data: impl Into<Bytes>) -> bool {
        let mut state = self.state();
        match state
            .containers
            .get_mut(container)
            .and_then(|objects| objects.get_mut(name))
        {
            Some(obj) => {
                obj.data = data.into();
                true
            }
            None => false,
        }
    }

    async fn delay(&self) {
        let latency = self.faults().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn lookup(&self, container: &str, name: &str) -> Result<StoredObject> {
        let state = self.state();
        let objects = state
            .containers
            .get(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        objects
            .get(name)
            .cloned()
            .ok_or_else(|| Error::object_not_found(container, name))
    }

    /// Concatenated content of a manifest, or an error naming the first
    /// missing segment.
    fn assemble(&self, manifest: &Manifest) -> Result<Bytes> {
        let state = self.state();
        let mut out = BytesMut::with_capacity(manifest.total_size() as usize);
        for segment in &manifest.segments {
            let data = state
                .containers
                .get(&segment.container)
                .and_then(|objects| objects.get(&segment.name))
                .map(|obj| obj.data.clone())
                .ok_or_else(|| {
                    Error::backend_status(
                        409,
                        format!("manifest segment {} is missing", segment.path()),
                    )
                })?;
            out.extend_from_slice(&data);
        }
        Ok(out.freeze())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn container_exists(&self, container: &str) -> Result<bool> {
        self.delay().await;
        Ok(self.state().containers.contains_key(container))
    }

    async fn container_create(&self, container: &str) -> Result<()> {
        self.delay().await;
        if self.faults().fail_container_create {
            return Err(Error::backend_status(403, "container creation denied"));
        }
        self.state()
            .containers
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn container_delete(&self, container: &str) -> Result<()> {
        self.delay().await;
        let mut state = self.state();
        match state.containers.get(container) {
            None => Err(Error::ContainerNotFound(container.to_string())),
            Some(objects) if !objects.is_empty() => Err(Error::backend_status(
                409,
                format!("container `{container}` is not empty"),
            )),
            Some(_) => {
                state.containers.remove(container);
                Ok(())
            }
        }
    }

    async fn object_open(
        &self,
        container: &str,
        name: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectBody> {
        self.delay().await;
        let obj = self.lookup(container, name)?;
        let data = match &obj.manifest {
            Some(manifest) => self.assemble(manifest)?,
            None => obj.data.clone(),
        };
        let data = match range {
            Some(range) => {
                let (start, end) = range.resolve(data.len() as u64).ok_or_else(|| {
                    Error::backend_status(416, format!("range {range:?} not satisfiable"))
                })?;
                data.slice(start as usize..end as usize)
            }
            None => data,
        };
        // Small chunks so readers see a real multi-item stream.
        let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
            .step_by(4096)
            .map(|start| Ok(data.slice(start..(start + 4096).min(data.len()))))
            .collect();
        Ok(ObjectBody {
            stream: stream::iter(chunks).boxed(),
            etag: Some(obj.etag.clone()),
            static_large_object: obj.manifest.is_some(),
        })
    }

    async fn object_stat(&self, container: &str, name: &str) -> Result<ObjectInfo> {
        self.delay().await;
        let obj = self.lookup(container, name)?;
        Ok(ObjectInfo {
            name: name.to_string(),
            bytes: obj.size(),
            etag: obj.etag.clone(),
            last_modified: obj.last_modified,
            static_large_object: obj.manifest.is_some(),
        })
    }

    async fn object_put(
        &self,
        container: &str,
        name: &str,
        mut body: ByteStream,
        _content_length: Option<u64>,
    ) -> Result<String> {
        self.delay().await;
        if !self.state().containers.contains_key(container) {
            return Err(Error::ContainerNotFound(container.to_string()));
        }
        let attempt = self.puts.fetch_add(1, Ordering::SeqCst);
        let failing = matches!(self.faults().puts_before_failure, Some(n) if attempt >= n);

        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| {
                Error::backend(format!("reading request body for `{name}`: {err}"))
            })?;
            data.extend_from_slice(&chunk);
        }
        if failing {
            return Err(Error::backend_status(
                503,
                format!("injected write failure for `{name}`"),
            ));
        }

        let data = data.freeze();
        let etag = md5_hex(&data);
        let mut state = self.state();
        let objects = state
            .containers
            .get_mut(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        objects.insert(
            name.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
                last_modified: Utc::now(),
                manifest: None,
            },
        );
        Ok(etag)
    }

    async fn manifest_put(&self, container: &str, name: &str, manifest: &Manifest) -> Result<()> {
        self.delay().await;
        if self.faults().fail_manifest_put {
            return Err(Error::backend_status(
                503,
                format!("injected manifest failure for `{name}`"),
            ));
        }
        let mut state = self.state();
        for segment in &manifest.segments {
            let stored = state
                .containers
                .get(&segment.container)
                .and_then(|objects| objects.get(&segment.name));
            match stored {
                Some(obj) if obj.etag == segment.etag && obj.size() == segment.size_bytes => {}
                Some(_) => {
                    return Err(Error::backend_status(
                        400,
                        format!("segment {} does not match manifest", segment.path()),
                    ));
                }
                None => {
                    return Err(Error::backend_status(
                        400,
                        format!("segment {} does not exist", segment.path()),
                    ));
                }
            }
        }
        let objects = state
            .containers
            .get_mut(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        objects.insert(
            name.to_string(),
            StoredObject {
                data: Bytes::new(),
                etag: manifest.etag(),
                last_modified: Utc::now(),
                manifest: Some(manifest.clone()),
            },
        );
        Ok(())
    }

    async fn manifest_get(&self, container: &str, name: &str) -> Result<Option<Manifest>> {
        self.delay().await;
        Ok(self.lookup(container, name)?.manifest)
    }

    async fn object_delete(&self, container: &str, name: &str) -> Result<()> {
        self.delay().await;
        let mut state = self.state();
        let objects = state
            .containers
            .get_mut(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::object_not_found(container, name))
    }

    async fn object_names(&self, container: &str, opts: &ListOpts) -> Result<Vec<String>> {
        self.delay().await;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let (page_cap, stale) = {
            let faults = self.faults();
            (faults.page_cap, faults.stale_listing)
        };
        let mut opts = opts.clone();
        if let Some(cap) = page_cap {
            opts.limit = Some(opts.limit.map_or(cap, |limit| limit.min(cap)));
        }
        if stale {
            opts.marker = None;
        }

        let state = self.state();
        let objects = state
            .containers
            .get(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        let mut page = ListingPage::new(&opts);
        for name in objects.range(opts.prefix.clone()..).map(|(name, _)| name) {
            if !name.starts_with(&opts.prefix) {
                break;
            }
            if !page.offer(name) {
                break;
            }
        }
        Ok(page.finish())
    }
}
