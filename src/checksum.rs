//! MD5 integrity checks applied while bytes stream through.

use crate::payload::ByteStream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

/// Hex MD5 of `data`.
pub fn md5_hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(data))
}

/// Normalize an ETag header value (`"abc"` → `abc`, lowercase).
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_ascii_lowercase()
}

#[derive(Default)]
struct TapState {
    digest: Option<md5::Context>,
    bytes: u64,
    read_error: Option<(io::ErrorKind, String)>,
}

/// Shared view on what a [`HashingStream`] has seen so far.
#[derive(Clone, Default)]
pub struct HashTap {
    state: Arc<Mutex<TapState>>,
}

impl HashTap {
    /// Hex MD5 of every byte that passed through the tap.
    pub fn hex_digest(&self) -> String {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = state.digest.take().unwrap_or_else(md5::Context::new);
        format!("{:x}", ctx.compute())
    }

    pub fn bytes(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).bytes
    }

    /// The source read failure, if the wrapped stream produced one.
    pub fn read_error(&self) -> Option<io::Error> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .read_error
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }
}

/// Pass-through stream that hashes every chunk and remembers source errors.
///
/// The stream is usually moved into a request body, so the results are read
/// back through the [`HashTap`] handle once the request completes.
pub struct HashingStream {
    inner: ByteStream,
    tap: HashTap,
}

impl HashingStream {
    pub fn new(inner: ByteStream) -> (Self, HashTap) {
        let tap = HashTap::default();
        tap.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .digest = Some(md5::Context::new());
        (
            Self {
                inner,
                tap: tap.clone(),
            },
            tap,
        )
    }
}

impl Stream for HashingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = futures::ready!(this.inner.poll_next_unpin(cx));
        let mut state = this.tap.state.lock().unwrap_or_else(|e| e.into_inner());
        match &item {
            Some(Ok(chunk)) => {
                if let Some(ctx) = state.digest.as_mut() {
                    ctx.consume(chunk);
                }
                state.bytes += chunk.len() as u64;
            }
            Some(Err(err)) => {
                state.read_error = Some((err.kind(), err.to_string()));
            }
            None => {}
        }
        Poll::Ready(item)
    }
}

/// Stream that checks the MD5 of everything it yields against an expected
/// ETag, failing with `InvalidData` at end of stream on mismatch.
pub struct VerifyingStream {
    inner: ByteStream,
    ctx: Option<md5::Context>,
    expected: String,
    name: String,
}

impl VerifyingStream {
    pub fn new(inner: ByteStream, expected_etag: &str, name: impl Into<String>) -> Self {
        Self {
            inner,
            ctx: Some(md5::Context::new()),
            expected: normalize_etag(expected_etag),
            name: name.into(),
        }
    }
}

impl Stream for VerifyingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(ctx) = this.ctx.as_mut() else {
            return Poll::Ready(None);
        };
        match futures::ready!(this.inner.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => {
                ctx.consume(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => {
                this.ctx = None;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                let actual = this.ctx.take().map(|c| format!("{:x}", c.compute()));
                match actual {
                    Some(actual) if actual != this.expected => {
                        Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "md5 mismatch reading `{}`: expected {}, got {}",
                                this.name, this.expected, actual
                            ),
                        ))))
                    }
                    _ => Poll::Ready(None),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::read_all;
    use futures::stream;

    fn chunks(parts: &'static [&'static [u8]]) -> ByteStream {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p)))).boxed()
    }

    #[tokio::test]
    async fn hashing_stream_reports_digest_and_size() {
        let (hashing, tap) = HashingStream::new(chunks(&[b"hello ", b"world"]));
        let data = read_all(hashing.boxed()).await.unwrap();
        assert_eq!(data, b"hello world");
        assert_eq!(tap.bytes(), 11);
        assert_eq!(tap.hex_digest(), md5_hex("hello world"));
        assert!(tap.read_error().is_none());
    }

    #[tokio::test]
    async fn hashing_stream_remembers_read_errors() {
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "source gone")),
        ])
        .boxed();
        let (hashing, tap) = HashingStream::new(failing);
        assert!(read_all(hashing.boxed()).await.is_err());
        let err = tap.read_error().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn verifying_stream_accepts_matching_digest() {
        let expected = format!("\"{}\"", md5_hex("abcdef"));
        let verified = VerifyingStream::new(chunks(&[b"abc", b"def"]), &expected, "obj");
        assert_eq!(read_all(verified.boxed()).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn verifying_stream_rejects_mismatch_at_end() {
        let verified = VerifyingStream::new(chunks(&[b"abc"]), &md5_hex("xyz"), "obj");
        let err = read_all(verified.boxed()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
