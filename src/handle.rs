//! A streaming handle over one archived file: `Unstarted → Streaming →
//! VerifiedOk | VerifiedFail → Closed`.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cache::Cache;
use crate::decompress::{self, DecoderPool};
use crate::digest::FileDigest;
use crate::entry::{Compression, Entry};
use crate::errors::Error;
use crate::source::{ByteSource, SectionReader};

/// The data carried by a failed verification, cheap to clone so every
/// subsequent `read`/`close` call after the first failure can hand back
/// an equivalent error without re-running the check.
#[derive(Clone)]
enum StickyError {
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    Decompression(String),
}

impl StickyError {
    fn into_error(self) -> Error {
        match self {
            StickyError::HashMismatch { path, expected, actual } => Error::HashMismatch {
                path: Some(path),
                expected,
                actual,
            },
            StickyError::Decompression(msg) => Error::Decompression(msg),
        }
    }
}

enum State {
    Unstarted,
    Streaming {
        body: Pin<Box<dyn AsyncRead + Send>>,
        remaining: u64,
        hasher: Sha256,
    },
    VerifiedOk,
    VerifiedFail(StickyError),
    Closed,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime_nanos: i128,
}

/// A single-owner, not-thread-shared handle over one entry's content.
/// Multiple handles over the same entry (or different entries) may
/// coexist; a given handle must not be driven from more than one task at
/// once.
pub struct FileHandle {
    entry: Entry,
    source: Arc<dyn ByteSource>,
    decoder_pool: Arc<DecoderPool>,
    verify_on_close: bool,
    state: State,
}

async fn do_read(state: &mut State, buf: &mut [u8]) -> Result<usize, Error> {
    match state {
        State::Streaming { body, remaining, hasher } => {
            if *remaining == 0 {
                return Ok(0);
            }
            let want = (buf.len() as u64).min(*remaining) as usize;
            match body.read(&mut buf[..want]).await {
                Ok(0) => Err(Error::Decompression(
                    "unexpected EOF before all expected bytes were read".to_string(),
                )),
                Ok(n) => {
                    hasher.update(&buf[..n]);
                    *remaining -= n as u64;
                    Ok(n)
                }
                Err(e) => Err(e.into()),
            }
        }
        State::VerifiedFail(sticky) => Err(sticky.clone().into_error()),
        State::VerifiedOk | State::Closed => Ok(0),
        State::Unstarted => unreachable!("ensure_started leaves Unstarted only via an early error return"),
    }
}

impl FileHandle {
    pub fn new(entry: Entry, source: Arc<dyn ByteSource>, decoder_pool: Arc<DecoderPool>, verify_on_close: bool) -> Self {
        Self {
            entry,
            source,
            decoder_pool,
            verify_on_close,
            state: State::Unstarted,
        }
    }

    pub fn stat(&self) -> FileInfo {
        FileInfo {
            name: crate::path::base(&self.entry.path).to_string(),
            size: self.entry.original_size,
            mode: self.entry.mode,
            mtime_nanos: self.entry.mtime_nanos,
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Whether the entry has been fully read and its hash confirmed.
    pub fn is_verified(&self) -> bool {
        matches!(self.state, State::VerifiedOk)
    }

    async fn ensure_started(&mut self) -> Result<(), Error> {
        if !matches!(self.state, State::Unstarted) {
            return Ok(());
        }

        let end = self
            .entry
            .data_offset
            .checked_add(self.entry.data_size)
            .filter(|&end| end <= self.source.size());
        if end.is_none() {
            return Err(Error::SizeOverflow(format!(
                "{}: data range [{}, {}) exceeds source size {}",
                self.entry.path,
                self.entry.data_offset,
                self.entry.data_offset + self.entry.data_size,
                self.source.size()
            )));
        }

        let section = SectionReader::new(self.source.clone(), self.entry.data_offset, self.entry.data_size);
        let body: Pin<Box<dyn AsyncRead + Send>> = match self.entry.compression {
            Compression::None => Box::pin(section),
            Compression::Zstd => {
                let decoder = self.decoder_pool.open_stream(decompress::buffered(section)).await;
                Box::pin(decoder)
            }
        };

        self.state = State::Streaming {
            body,
            remaining: self.entry.original_size,
            hasher: Sha256::new(),
        };
        Ok(())
    }

    fn finish_verification(&mut self) -> Result<(), Error> {
        let prior = std::mem::replace(&mut self.state, State::Closed);
        let State::Streaming { hasher, .. } = prior else {
            self.state = prior;
            return Ok(());
        };

        let actual = FileDigest::from(hasher.finalize());
        if actual == self.entry.hash {
            self.state = State::VerifiedOk;
            Ok(())
        } else {
            let sticky = StickyError::HashMismatch {
                path: self.entry.path.clone(),
                expected: self.entry.hash.to_string(),
                actual: actual.to_string(),
            };
            let err = sticky.clone().into_error();
            self.state = State::VerifiedFail(sticky);
            Err(err)
        }
    }

    /// Reads up to `buf.len()` bytes of decompressed, as-yet-unverified
    /// content. A return of `Ok(0)` means either the entry is exhausted
    /// (and, on the call that crosses into exhaustion, has just been
    /// verified) or the handle is already in a terminal state.
    #[tracing::instrument(skip(self, buf), fields(path = %self.entry.path))]
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.ensure_started().await?;

        match do_read(&mut self.state, buf).await {
            Ok(n) => {
                let just_finished = matches!(&self.state, State::Streaming { remaining, .. } if *remaining == 0);
                if just_finished {
                    self.finish_verification()?;
                }
                Ok(n)
            }
            Err(e) => {
                if matches!(self.state, State::Streaming { .. }) {
                    let sticky = match &e {
                        Error::Decompression(msg) => StickyError::Decompression(msg.clone()),
                        other => StickyError::Decompression(other.to_string()),
                    };
                    self.state = State::VerifiedFail(sticky);
                }
                Err(e)
            }
        }
    }

    /// Direct range read against the source, bypassing decompression and
    /// verification. Only defined for uncompressed entries.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        if self.entry.compression != Compression::None {
            return Err(Error::Unsupported("read_at is not supported on compressed entries"));
        }
        if offset >= self.entry.original_size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.entry.original_size - offset) as usize;
        let absolute = self.entry.data_offset + offset;
        self.source.read_at(&mut buf[..want], absolute).await
    }

    /// Drains to EOF (forcing verification) if `verify_on_close` and
    /// verification has not already happened, then transitions to
    /// `Closed` unconditionally, releasing any pooled decoder.
    #[tracing::instrument(skip(self), fields(path = %self.entry.path))]
    pub async fn close(&mut self) -> Result<(), Error> {
        let needs_drain =
            self.verify_on_close && !matches!(self.state, State::VerifiedOk | State::VerifiedFail(_) | State::Closed);

        if needs_drain {
            if let Err(e) = self.ensure_started().await {
                self.state = State::Closed;
                return Err(e);
            }
            let mut sink = [0u8; 8192];
            loop {
                match self.read(&mut sink).await {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        self.state = State::Closed;
                        return Err(e);
                    }
                }
            }
        }

        let prior = std::mem::replace(&mut self.state, State::Closed);
        match prior {
            State::VerifiedFail(sticky) => Err(sticky.into_error()),
            _ => Ok(()),
        }
    }
}

/// An in-memory file handle over already-verified, cached bytes. Returned
/// by `Reader::open` on a cache hit instead of re-streaming from the
/// backing source.
pub struct CachedFile {
    info: FileInfo,
    bytes: Bytes,
    pos: usize,
}

impl CachedFile {
    pub(crate) fn new(info: FileInfo, bytes: Bytes) -> Self {
        Self { info, bytes, pos: 0 }
    }

    pub fn stat(&self) -> FileInfo {
        self.info.clone()
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let remaining = &self.bytes[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Wraps a [`FileHandle`] so that, once the stream drains to a verified
/// EOF, the accumulated bytes are written into `cache` under the entry's
/// hash. This is the tee side of `Reader::open`'s cache-miss path: the
/// caller reads through `self` exactly as it would a plain `FileHandle`,
/// and the cache is warmed as a side effect.
pub struct CachingFileHandle {
    inner: FileHandle,
    cache: Arc<dyn Cache>,
    hash: FileDigest,
    verify_on_close: bool,
    buf: Vec<u8>,
    committed: bool,
}

impl CachingFileHandle {
    pub(crate) fn new(inner: FileHandle, cache: Arc<dyn Cache>, verify_on_close: bool) -> Self {
        let hash = inner.entry().hash.clone();
        Self {
            inner,
            cache,
            hash,
            verify_on_close,
            buf: Vec::new(),
            committed: false,
        }
    }

    pub fn stat(&self) -> FileInfo {
        self.inner.stat()
    }

    pub fn entry(&self) -> &Entry {
        self.inner.entry()
    }

    #[tracing::instrument(skip(self, buf), fields(path = %self.inner.entry().path))]
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = self.inner.read(buf).await?;
        if !self.committed {
            self.buf.extend_from_slice(&buf[..n]);
            if self.inner.is_verified() {
                self.commit().await;
            }
        }
        Ok(n)
    }

    async fn commit(&mut self) {
        self.committed = true;
        let content = Bytes::from(std::mem::take(&mut self.buf));
        if let Err(e) = self.cache.put(&self.hash, content).await {
            tracing::debug!(hash = %self.hash, error = %e, "cache put failed after streamed open");
        }
    }

    #[tracing::instrument(skip(self), fields(path = %self.inner.entry().path))]
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.verify_on_close && !self.committed {
            let mut sink = [0u8; 8192];
            loop {
                match self.read(&mut sink).await {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::decompress::DecoderPoolOptions;
    use crate::digest::FileDigest;
    use crate::source::MemorySource;

    fn entry(path: &str, data_offset: u64, data_size: u64, original_size: u64, hash: FileDigest, compression: Compression) -> Entry {
        Entry {
            path: path.to_string(),
            data_offset,
            data_size,
            original_size,
            hash,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime_nanos: 0,
            compression,
        }
    }

    fn pool() -> Arc<DecoderPool> {
        Arc::new(DecoderPool::new(DecoderPoolOptions::default()))
    }

    #[tokio::test]
    async fn reads_and_verifies_uncompressed_content() {
        let content = b"content of a";
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from_static(content), "mem"));
        let e = entry(
            "a.txt",
            0,
            content.len() as u64,
            content.len() as u64,
            FileDigest::of(content),
            Compression::None,
        );
        let mut handle = FileHandle::new(e, source, pool(), true);

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = handle.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, content);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn reads_and_verifies_compressed_content() {
        let content = b"hello world ".repeat(200);
        let compressed = zstd::encode_all(content.as_slice(), 3).unwrap();
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from(compressed.clone()), "mem"));
        let e = entry(
            "big.txt",
            0,
            compressed.len() as u64,
            content.len() as u64,
            FileDigest::of(&content),
            Compression::Zstd,
        );
        let mut handle = FileHandle::new(e, source, pool(), true);

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = handle.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, content);
    }

    #[tokio::test]
    async fn tampered_bytes_surface_hash_mismatch() {
        let content = b"content of a";
        let mut tampered = content.to_vec();
        tampered[0] ^= 0xFF;
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from(tampered), "mem"));
        let e = entry(
            "a.txt",
            0,
            content.len() as u64,
            content.len() as u64,
            FileDigest::of(content),
            Compression::None,
        );
        let mut handle = FileHandle::new(e, source, pool(), true);

        let mut buf = [0u8; 32];
        loop {
            match handle.read(&mut buf).await {
                Ok(0) => panic!("expected a hash mismatch before EOF"),
                Ok(_) => continue,
                Err(Error::HashMismatch { .. }) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        // Sticky: a further read also reports the mismatch.
        assert!(matches!(handle.read(&mut buf).await, Err(Error::HashMismatch { .. })));
    }

    #[tokio::test]
    async fn read_at_unsupported_for_compressed_entries() {
        let compressed = zstd::encode_all(&b"abc"[..], 3).unwrap();
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from(compressed.clone()), "mem"));
        let e = entry("z.txt", 0, compressed.len() as u64, 3, FileDigest::of(b"abc"), Compression::Zstd);
        let handle = FileHandle::new(e, source, pool(), true);

        let mut buf = [0u8; 3];
        assert!(matches!(handle.read_at(&mut buf, 0).await, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn read_at_reads_a_sub_range_of_uncompressed_entries() {
        let content = b"0123456789";
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from_static(content), "mem"));
        let e = entry("n.txt", 0, 10, 10, FileDigest::of(content), Compression::None);
        let handle = FileHandle::new(e, source, pool(), true);

        let mut buf = [0u8; 4];
        let n = handle.read_at(&mut buf, 3).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"3456");
    }

    #[tokio::test]
    async fn close_without_reading_still_verifies_when_enabled() {
        let content = b"content of a";
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from_static(content), "mem"));
        let e = entry(
            "a.txt",
            0,
            content.len() as u64,
            content.len() as u64,
            FileDigest::of(content),
            Compression::None,
        );
        let mut handle = FileHandle::new(e, source, pool(), true);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_skips_verification_when_disabled_and_unread() {
        let content = b"content of a";
        // A tampered source would normally fail verification; with
        // verify_on_close = false and no reads performed, close() must not
        // notice.
        let mut tampered = content.to_vec();
        tampered[0] ^= 0xFF;
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from(tampered), "mem"));
        let e = entry(
            "a.txt",
            0,
            content.len() as u64,
            content.len() as u64,
            FileDigest::of(content),
            Compression::None,
        );
        let mut handle = FileHandle::new(e, source, pool(), false);
        handle.close().await.unwrap();
    }
}
