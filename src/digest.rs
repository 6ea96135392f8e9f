//! The 32-byte SHA-256 content digest used to identify file contents
//! throughout the archive: per-[`Entry`](crate::entry::Entry) hashes, the
//! optional index-level `data_hash`, and cache keys all use this type.

use data_encoding::HEXLOWER;
use digest::Digest;
use pin_project_lite::pin_project;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::AsyncRead;

pub const DIGEST_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DigestError {
    #[error("invalid digest length: {0}")]
    InvalidLen(usize),
}

/// A 32-byte SHA-256 content digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FileDigest([u8; DIGEST_LEN]);

impl FileDigest {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl From<[u8; DIGEST_LEN]> for FileDigest {
    fn from(value: [u8; DIGEST_LEN]) -> Self {
        Self(value)
    }
}

impl From<digest::Output<Sha256>> for FileDigest {
    fn from(value: digest::Output<Sha256>) -> Self {
        Self(value.into())
    }
}

impl TryFrom<&[u8]> for FileDigest {
    type Error = DigestError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; DIGEST_LEN] = value
            .try_into()
            .map_err(|_| DigestError::InvalidLen(value.len()))?;
        Ok(Self(arr))
    }
}

impl TryFrom<Vec<u8>> for FileDigest {
    type Error = DigestError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::try_from(value.as_slice())
    }
}

impl std::fmt::Display for FileDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for FileDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", HEXLOWER.encode(&self.0))
    }
}

pin_project! {
    /// Wraps an [`AsyncRead`], tracking the SHA-256 digest of every byte
    /// that has passed through it so far.
    pub struct HashingReader<R>
    where
        R: AsyncRead,
    {
        #[pin]
        inner: R,
        hasher: Sha256,
    }
}

impl<R> HashingReader<R>
where
    R: AsyncRead,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Consumes the reader, returning the digest of everything read through it.
    pub fn finalize(self) -> FileDigest {
        self.hasher.finalize().into()
    }

    /// Consumes the reader, returning the wrapped reader back along with
    /// the digest of everything read through it. Used where the caller
    /// still needs the inner reader afterwards (e.g. to re-`fstat` an open
    /// file handle).
    pub fn into_parts(self) -> (R, FileDigest) {
        (self.inner, self.hasher.finalize().into())
    }
}

impl<R> tokio::io::AsyncRead for HashingReader<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let filled_before = buf.filled().len();

        let this = self.project();
        let ret = this.inner.poll_read(cx, buf);

        this.hasher.update(&buf.filled()[filled_before..]);

        ret
    }
}

pin_project! {
    /// Wraps an `AsyncWrite`, tracking the SHA-256 digest of every byte
    /// written through it so far. The writer-side counterpart to
    /// [`HashingReader`], used to compute the index-level `data_hash` over
    /// the whole data blob as the writer streams it out.
    pub struct HashingWriter<W> {
        #[pin]
        inner: W,
        hasher: Sha256,
    }
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> FileDigest {
        self.hasher.finalize().into()
    }
}

impl<W> tokio::io::AsyncWrite for HashingWriter<W>
where
    W: tokio::io::AsyncWrite,
{
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.project();
        let ret = this.inner.poll_write(cx, buf);
        if let std::task::Poll::Ready(Ok(n)) = &ret {
            this.hasher.update(&buf[..*n]);
        }
        ret
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rstest::rstest;

    use super::*;
    use crate::fixtures::{EMPTY_CONTENT, EMPTY_CONTENT_DIGEST, SMALL_CONTENT, SMALL_CONTENT_DIGEST};

    #[rstest]
    #[case::small(&SMALL_CONTENT, &*SMALL_CONTENT_DIGEST)]
    #[case::empty(&EMPTY_CONTENT, &*EMPTY_CONTENT_DIGEST)]
    #[tokio::test]
    async fn hashing_reader_matches_direct_hash(#[case] data: &[u8], #[case] expected: &FileDigest) {
        let mut hr = HashingReader::new(Cursor::new(data));
        tokio::io::copy(&mut hr, &mut tokio::io::sink())
            .await
            .expect("read must succeed");
        assert_eq!(hr.finalize(), *expected);
    }

    #[test]
    fn display_is_hex_with_algorithm_prefix() {
        let d = FileDigest::of(b"hello");
        assert!(d.to_string().starts_with("sha256:"));
        assert_eq!(d.to_string().len(), "sha256:".len() + 64);
    }

    #[test]
    fn try_from_rejects_wrong_length() {
        assert_eq!(
            FileDigest::try_from(vec![0u8; 31]),
            Err(DigestError::InvalidLen(31))
        );
    }
}
