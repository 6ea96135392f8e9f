//! The byte-source abstraction the reader, file handles and batch
//! processor read the data blob through.
//!
//! Concrete backends beyond the two provided here — notably an HTTP-range
//! client against the content-addressed registry — are external
//! collaborators and live outside this crate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::RwLock;

use crate::errors::Error;

/// An opaque, `read_at`-capable backing for the data blob.
///
/// Implementations must be safe for concurrent `read_at` calls: the batch
/// processor and multiple file handles may all be reading through the same
/// source at once.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read. `n < buf.len()` only at or near the
    /// end of the source; `n == 0` means `offset >= size()`.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error>;

    /// Total length of the source in bytes.
    fn size(&self) -> u64;

    /// A stable identifier for this source, used as part of block-cache
    /// keys. Must be unique across the cache's lifetime for distinct
    /// underlying content.
    fn source_id(&self) -> &str;
}

/// Reads exactly `buf.len()` bytes (short of EOF), looping over `read_at`
/// as needed. Used anywhere a caller needs a full range and treats a short
/// read as fatal (the batch processor's group fetch, in particular).
pub async fn read_at_exact(source: &dyn ByteSource, buf: &mut [u8], offset: u64) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read_at(&mut buf[filled..], offset + filled as u64).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "short read at offset {}: wanted {}, got {}",
                    offset,
                    buf.len(),
                    filled
                ),
            )
            .into());
        }
        filled += n;
    }
    Ok(())
}

/// A [`ByteSource`] backed by an in-memory buffer. Used in tests and for
/// small archives that fit comfortably in memory.
pub struct MemorySource {
    data: Bytes,
    source_id: String,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>, source_id: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            source_id: source_id.into(),
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let offset = crate::sizing::u64_to_usize(offset, "MemorySource::read_at offset")?;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let available = &self.data[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}

/// A [`ByteSource`] backed by a single local file. The file handle is
/// shared behind a lock since `std::fs::File`'s positional reads on most
/// platforms are not otherwise safe to issue concurrently without racing
/// the shared file cursor.
pub struct FileSource {
    file: RwLock<std::fs::File>,
    size: u64,
    source_id: String,
}

impl FileSource {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let source_id = path.display().to_string();
        let (file, size) = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
            let file = std::fs::File::open(&path)?;
            let size = file.metadata()?.len();
            Ok((file, size))
        })
        .await
        .map_err(|e| Error::from(std::io::Error::other(e)))??;

        Ok(Self {
            file: RwLock::new(file),
            size,
            source_id,
        })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        use std::os::unix::fs::FileExt;

        let guard = self.file.read().await;
        // `read_at` on a `File` takes `&self`, so the lock here is only to
        // serialize with a hypothetical concurrent writer/reopen; reads
        // themselves do not race each other.
        let mut total = 0;
        loop {
            match guard.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total == buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}

type PendingRead = Pin<Box<dyn Future<Output = Result<(Vec<u8>, usize), Error>> + Send>>;

/// Presents a `[start, start + len)` byte range of a [`ByteSource`] as a
/// sequential `AsyncRead`. Used to open the section a file handle reads
/// from, with or without a decompressing layer on top.
///
/// Reads are strictly sequential: there is no seek. Each poll either
/// drives a pending `read_at` future to completion or issues a new one
/// sized to the caller's buffer and the remaining section length.
pub struct SectionReader {
    source: Arc<dyn ByteSource>,
    pos: u64,
    end: u64,
    pending: Option<PendingRead>,
}

impl SectionReader {
    pub fn new(source: Arc<dyn ByteSource>, start: u64, len: u64) -> Self {
        Self {
            source,
            pos: start,
            end: start.saturating_add(len),
            pending: None,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.pos)
    }
}

impl AsyncRead for SectionReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.pending.as_mut() {
                return match fut.as_mut().poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Ok((data, n))) => {
                        this.pending = None;
                        this.pos += n as u64;
                        buf.put_slice(&data[..n]);
                        Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Err(e)) => {
                        this.pending = None;
                        Poll::Ready(Err(std::io::Error::other(e)))
                    }
                };
            }

            let remaining = this.remaining();
            let want = (buf.remaining() as u64).min(remaining) as usize;
            if want == 0 {
                return Poll::Ready(Ok(()));
            }

            let source = this.source.clone();
            let pos = this.pos;
            this.pending = Some(Box::pin(async move {
                let mut tmp = vec![0u8; want];
                let n = source.read_at(&mut tmp, pos).await?;
                Ok((tmp, n))
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_reads_in_range() {
        let src = MemorySource::new(Bytes::from_static(b"hello world"), "mem");
        let mut buf = [0u8; 5];
        let n = src.read_at(&mut buf, 6).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn memory_source_short_read_at_end() {
        let src = MemorySource::new(Bytes::from_static(b"hello"), "mem");
        let mut buf = [0u8; 10];
        let n = src.read_at(&mut buf, 3).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"lo");
    }

    #[tokio::test]
    async fn memory_source_past_end_is_zero() {
        let src = MemorySource::new(Bytes::from_static(b"hello"), "mem");
        let mut buf = [0u8; 4];
        let n = src.read_at(&mut buf, 100).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn read_at_exact_errors_on_short_read() {
        let src = MemorySource::new(Bytes::from_static(b"hi"), "mem");
        let mut buf = [0u8; 10];
        assert!(read_at_exact(&src, &mut buf, 0).await.is_err());
    }

    #[tokio::test]
    async fn file_source_reads_match_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"some file content").await.unwrap();
        let src = FileSource::open(&path).await.unwrap();
        assert_eq!(src.size(), 17);
        let mut buf = [0u8; 4];
        let n = src.read_at(&mut buf, 5).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"file");
    }

    #[tokio::test]
    async fn section_reader_yields_only_the_range() {
        let src: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from_static(b"0123456789"), "mem"));
        let mut section = SectionReader::new(src, 2, 5);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut section, &mut out).await.unwrap();
        assert_eq!(out, b"23456");
    }
}
