//! Upload sources.
//!
//! A [`Payload`] is a byte stream plus an optional length hint. The hint is
//! what the upload engine uses to choose between a single-shot write and a
//! segmented upload; it is never computed by consuming the stream.

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use std::io;
use tokio::{fs::File, io::AsyncRead};
use tokio_util::io::ReaderStream;

/// Stream of object bytes. Read failures surface as `Err` items.
pub type ByteStream = futures::stream::BoxStream<'static, io::Result<Bytes>>;

pub struct Payload {
    stream: ByteStream,
    size: Option<u64>,
}

impl Payload {
    /// In-memory bytes; size is known.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let size = data.len() as u64;
        Self {
            stream: stream::once(async move { Ok(data) }).boxed(),
            size: Some(size),
        }
    }

    /// Arbitrary byte stream; size is unknown unless set with [`Payload::with_size`].
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            size: None,
        }
    }

    /// Any async reader; size is unknown unless set with [`Payload::with_size`].
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::from_stream(ReaderStream::new(reader))
    }

    /// Regular file; size comes from the file metadata.
    pub async fn from_file(file: File) -> io::Result<Self> {
        let meta = file.metadata().await?;
        let payload = Self::from_reader(file);
        Ok(if meta.is_file() {
            payload.with_size(meta.len())
        } else {
            payload
        })
    }

    /// Declare the total size of the stream.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(data: &'static [u8]) -> Self {
        Self::from_bytes(Bytes::from_static(data))
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::from_bytes(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::from_bytes(data)
    }
}

/// Drain a byte stream into memory.
pub async fn read_all(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn size_hints() {
        assert_eq!(Payload::from_bytes(vec![0u8; 12]).size(), Some(12));
        assert_eq!(Payload::from_reader(&b"abc"[..]).size(), None);
        assert_eq!(
            Payload::from_reader(&b"abc"[..]).with_size(3).size(),
            Some(3)
        );

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let file = File::open(tmp.path()).await.unwrap();
        let payload = Payload::from_file(file).await.unwrap();
        assert_eq!(payload.size(), Some(11));
        assert_eq!(read_all(payload.into_stream()).await.unwrap(), b"hello world");
    }
}
