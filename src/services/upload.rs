//! Upload engine: single-shot writes and static large object uploads.
//!
//! An upload moves through `Sizing → Writing(Single | Segmented) →
//! Committing → Done`, or ends in `Aborted`. Segmented uploads stream each
//! chunk straight into its own segment request and commit a manifest only
//! after every segment is stored; an aborted upload deletes the segments it
//! already wrote and leaves any previous object under the same name alone.

use super::container::ContainerSettings;
use crate::{
    checksum::{HashingStream, md5_hex, normalize_etag},
    connection::Connection,
    errors::{Error, Result, WrapErr},
    models::{Manifest, SegmentRef},
    payload::{ByteStream, Payload},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, channel::mpsc, stream};
use std::io;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Chunks buffered between the source and a segment request.
const SEGMENT_BODY_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    Single,
    Segmented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Sizing,
    Writing(WritePath),
    Committing,
    Done,
    Aborted,
}

/// What a finished upload wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub path: WritePath,
    pub bytes: u64,
    /// Number of segments behind the manifest; 0 for single-shot writes.
    pub segments: usize,
}

/// Unknown sizes are treated as possibly large.
pub fn plan(size: Option<u64>, chunk_size: u64) -> WritePath {
    match size {
        Some(size) if size < chunk_size => WritePath::Single,
        _ => WritePath::Segmented,
    }
}

/// Directory of the segments of one upload attempt of `container/name`.
pub fn segment_prefix(container: &str, name: &str, upload_id: Uuid) -> String {
    format!(
        "segments/{}/{}/",
        md5_hex(format!("{container}/{name}")),
        upload_id.simple()
    )
}

pub fn segment_name(prefix: &str, seq: u64) -> String {
    format!("{prefix}{seq:016}")
}

/// Fails the stream if it does not yield exactly `expected` bytes. The
/// result is fused, so it may be polled again after it ends.
fn exact_length(inner: ByteStream, expected: u64) -> ByteStream {
    stream::unfold((inner, 0u64, false), move |(mut inner, seen, done)| async move {
        if done {
            return None;
        }
        match inner.next().await {
            Some(Ok(chunk)) => {
                let seen = seen + chunk.len() as u64;
                if seen > expected {
                    let err = io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("source is longer than its declared {expected} bytes"),
                    );
                    Some((Err(err), (inner, seen, true)))
                } else {
                    Some((Ok(chunk), (inner, seen, false)))
                }
            }
            Some(Err(err)) => Some((Err(err), (inner, seen, true))),
            None if seen < expected => {
                let err = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended after {seen} of {expected} bytes"),
                );
                Some((Err(err), (inner, seen, true)))
            }
            None => None,
        }
    })
    .fuse()
    .boxed()
}

/// Outcome of feeding one segment body.
enum Pump {
    /// Segment fully sent: digest, size and bytes left over for the next one.
    Sent {
        digest: String,
        size: u64,
        leftover: Option<Bytes>,
    },
    /// The source failed; the body was terminated with an error.
    ReadFailed(io::Error),
    /// The request stopped consuming the body early.
    Closed,
}

/// Next non-empty chunk of `source`.
async fn next_chunk(source: &mut ByteStream) -> io::Result<Option<Bytes>> {
    while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        if !chunk.is_empty() {
            return Ok(Some(chunk));
        }
    }
    Ok(None)
}

/// Forward up to `limit` bytes from `first` and `source` into `tx`.
async fn pump_segment(
    source: &mut ByteStream,
    first: Bytes,
    limit: u64,
    mut tx: mpsc::Sender<io::Result<Bytes>>,
) -> Pump {
    let mut ctx = md5::Context::new();
    let mut remaining = limit;
    let mut pending = Some(first);
    let mut leftover = None;
    while remaining > 0 {
        let mut chunk = match pending.take() {
            Some(chunk) => chunk,
            None => match next_chunk(source).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    let forwarded = io::Error::new(err.kind(), err.to_string());
                    let _ = tx.send(Err(forwarded)).await;
                    return Pump::ReadFailed(err);
                }
            },
        };
        if chunk.len() as u64 > remaining {
            leftover = Some(chunk.split_off(remaining as usize));
        }
        remaining -= chunk.len() as u64;
        ctx.consume(&chunk);
        if tx.send(Ok(chunk)).await.is_err() {
            return Pump::Closed;
        }
    }
    Pump::Sent {
        digest: format!("{:x}", ctx.compute()),
        size: limit - remaining,
        leftover,
    }
}

pub struct UploadEngine<'a> {
    conn: &'a dyn Connection,
    settings: &'a ContainerSettings,
    state: UploadState,
    /// Segment names stored by this upload, for cleanup on abort.
    written: Vec<String>,
}

impl<'a> UploadEngine<'a> {
    pub fn new(conn: &'a dyn Connection, settings: &'a ContainerSettings) -> Self {
        Self {
            conn,
            settings,
            state: UploadState::Sizing,
            written: Vec::new(),
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    fn transition(&mut self, next: UploadState) {
        debug!(from = ?self.state, to = ?next, "upload state");
        self.state = next;
    }

    /// Upload `payload` as `name`, replacing any existing object.
    pub async fn run(&mut self, name: &str, payload: Payload) -> Result<UploadReport> {
        if name.is_empty() {
            return Err(Error::invalid_argument("object name cannot be empty"));
        }
        let size = payload.size();
        let path = plan(size, self.settings.chunk_size());
        if size.is_none() {
            warn!(name, "upload size unknown, using segmented upload");
        }
        self.transition(UploadState::Writing(path));

        let result = match (path, size) {
            (WritePath::Single, Some(size)) => self.write_single(name, payload, size).await,
            _ => self.write_segmented(name, payload).await,
        };
        match result {
            Ok(report) => {
                self.transition(UploadState::Done);
                debug!(name, ?report, "upload complete");
                Ok(report)
            }
            Err(err) => {
                self.abort().await;
                let label = match path {
                    WritePath::Single => "single",
                    WritePath::Segmented => "segmented",
                };
                Err(err.context(format!(
                    "upload {}/{} ({label})",
                    self.settings.name(),
                    name
                )))
            }
        }
    }

    async fn write_single(&mut self, name: &str, payload: Payload, size: u64) -> Result<UploadReport> {
        let (hashing, tap) = HashingStream::new(exact_length(payload.into_stream(), size));
        let result = self
            .conn
            .object_put(self.settings.name(), name, hashing.boxed(), Some(size))
            .await;
        if let Some(err) = tap.read_error() {
            return Err(Error::Read(err));
        }
        let etag = result?;
        let digest = tap.hex_digest();
        if normalize_etag(&etag) != digest {
            return Err(Error::backend(format!(
                "etag mismatch: backend reported {etag}, sent {digest}"
            )));
        }
        self.transition(UploadState::Committing);
        Ok(UploadReport {
            path: WritePath::Single,
            bytes: tap.bytes(),
            segments: 0,
        })
    }

    async fn write_segmented(&mut self, name: &str, payload: Payload) -> Result<UploadReport> {
        let chunk_size = self.settings.chunk_size();
        let segments_container = self.settings.segments_container().to_string();
        let prefix = segment_prefix(self.settings.name(), name, Uuid::new_v4());
        let mut source = match payload.size() {
            Some(size) => exact_length(payload.into_stream(), size),
            None => payload.into_stream().fuse().boxed(),
        };
        let mut carry: Option<Bytes> = None;
        let mut segments = Vec::new();
        let mut total = 0u64;

        loop {
            let first = match carry.take() {
                Some(chunk) => chunk,
                None => match next_chunk(&mut source).await.map_err(Error::Read)? {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            let seg_name = segment_name(&prefix, segments.len() as u64 + 1);
            let (tx, rx) = mpsc::channel(SEGMENT_BODY_BUFFER);
            let put = self
                .conn
                .object_put(&segments_container, &seg_name, rx.boxed(), None);
            let pump = pump_segment(&mut source, first, chunk_size, tx);
            let (put, pump) = futures::join!(put, pump);

            if put.is_ok() {
                self.written.push(seg_name.clone());
            }
            let (digest, size, leftover) = match pump {
                Pump::ReadFailed(err) => return Err(Error::Read(err)),
                Pump::Closed => {
                    put.wrap_err_with(|| format!("segment {seg_name}"))?;
                    return Err(Error::backend(format!(
                        "segment {seg_name}: request ended before its body"
                    )));
                }
                Pump::Sent {
                    digest,
                    size,
                    leftover,
                } => (digest, size, leftover),
            };
            let etag = put.wrap_err_with(|| format!("segment {seg_name}"))?;
            if normalize_etag(&etag) != digest {
                return Err(Error::backend(format!(
                    "segment {seg_name}: etag mismatch, backend reported {etag}, sent {digest}"
                )));
            }
            debug!(segment = %seg_name, size, "segment stored");
            total += size;
            segments.push(SegmentRef {
                container: segments_container.clone(),
                name: seg_name,
                etag: digest,
                size_bytes: size,
            });
            carry = leftover;
        }

        self.transition(UploadState::Committing);
        if segments.is_empty() {
            let etag = self
                .conn
                .object_put(self.settings.name(), name, stream::empty().boxed(), Some(0))
                .await?;
            let empty = md5_hex(b"");
            if normalize_etag(&etag) != empty {
                return Err(Error::backend(format!(
                    "etag mismatch: backend reported {etag} for an empty object"
                )));
            }
            return Ok(UploadReport {
                path: WritePath::Segmented,
                bytes: 0,
                segments: 0,
            });
        }

        let manifest = Manifest::new(segments);
        self.conn
            .manifest_put(self.settings.name(), name, &manifest)
            .await
            .wrap_err("commit manifest")?;
        info!(
            name,
            segments = manifest.segments.len(),
            bytes = total,
            "committed static large object"
        );
        Ok(UploadReport {
            path: WritePath::Segmented,
            bytes: total,
            segments: manifest.segments.len(),
        })
    }

    /// Delete every segment this upload stored. Failures are logged only.
    async fn abort(&mut self) {
        self.transition(UploadState::Aborted);
        let container = self.settings.segments_container();
        for seg_name in self.written.drain(..) {
            match self.conn.object_delete(container, &seg_name).await {
                Ok(()) => debug!(segment = %seg_name, "removed segment of aborted upload"),
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(
                    segment = %seg_name,
                    error = %err,
                    "failed to remove segment of aborted upload"
                ),
            }
        }
    }
}
