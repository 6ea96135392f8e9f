//! Shared test fixtures: sample content, their expected digests, and a
//! couple of small test-only [`ByteSource`] helpers reused by the writer,
//! reader, batch and cache test suites.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::digest::FileDigest;
use crate::errors::Error;
use crate::source::ByteSource;

pub const EMPTY_CONTENT: [u8; 0] = [];
pub const SMALL_CONTENT: [u8; 11] = *b"hello world";

pub static EMPTY_CONTENT_DIGEST: LazyLock<FileDigest> = LazyLock::new(|| FileDigest::of(&EMPTY_CONTENT));
pub static SMALL_CONTENT_DIGEST: LazyLock<FileDigest> = LazyLock::new(|| FileDigest::of(&SMALL_CONTENT));

/// A small sample tree, covering: nested directories, a file repeated
/// verbatim in two places (to exercise content dedup being a non-goal —
/// each copy gets its own entry), an empty file, and content compressible
/// enough to shrink under zstd.
pub const SAMPLE_TREE: &[(&str, &[u8])] = &[
    ("README.md", b"a small sample archive\n"),
    ("empty.txt", b""),
    ("src/main.rs", b"fn main() {}\n"),
    ("src/lib.rs", b"pub fn lib() {}\n"),
    (
        "assets/data.bin",
        b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
    ),
    ("assets/copy.bin", b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
];

/// Materializes [`SAMPLE_TREE`] under `root` on disk.
pub async fn write_sample_tree(root: &Path) {
    for (rel, content) in SAMPLE_TREE {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, content).await.unwrap();
    }
}

/// Wraps a [`ByteSource`], counting `read_at` calls. Used to assert that
/// concurrent identical requests against a cache are coalesced into a
/// single underlying fetch.
pub struct CountingSource<S> {
    inner: S,
    calls: AtomicUsize,
}

impl<S> CountingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: ByteSource> ByteSource for CountingSource<S> {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.read_at(buf, offset).await
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn source_id(&self) -> &str {
        self.inner.source_id()
    }
}

/// A [`ByteSource`] that always errors, for testing fetch-failure paths
/// (e.g. that a cache does not poison itself on a transient I/O error).
pub struct FailingSource {
    pub size: u64,
}

#[async_trait]
impl ByteSource for FailingSource {
    async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize, Error> {
        Err(std::io::Error::other("injected failure").into())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn source_id(&self) -> &str {
        "failing"
    }
}

pub fn memory_bytes(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(data)
}
