//! Serializes a directory tree into the archive's two-blob layout: a
//! sorted index blob of per-file entries and a data blob holding the
//! (optionally compressed) bytes in the same order.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::UNIX_EPOCH;

use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::digest::{HashingReader, HashingWriter};
use crate::entry::Compression;
use crate::errors::Error;
use crate::index::codec::{self, EncodeEntry};
use crate::sizing::{checked_add, u64_to_i64};

pub const DEFAULT_MAX_FILES: i64 = 1_000_000;
pub const DEFAULT_SKIP_COMPRESSION_THRESHOLD: u64 = 4096;
pub const DEFAULT_SKIP_COMPRESSION_EXTENSIONS: &[&str] = &[
    "gz", "zst", "bz2", "xz", "zip", "7z", "png", "jpg", "jpeg", "webp", "mp4", "mp3",
];
const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDetection {
    None,
    Strict,
}

/// `(relative_path, stat_before_read) -> bool`; `true` downgrades this
/// file to [`Compression::None`] regardless of the global setting.
pub type SkipCompressionPredicate = Arc<dyn Fn(&str, &std::fs::Metadata) -> bool + Send + Sync>;

pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct WriterOptions {
    pub compression: Compression,
    pub change_detection: ChangeDetection,
    pub skip_compression: Vec<SkipCompressionPredicate>,
    /// `0` uses [`DEFAULT_MAX_FILES`]; negative means unlimited.
    pub max_files: i64,
    pub progress: Option<ProgressCallback>,
    pub zstd_level: i32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            change_detection: ChangeDetection::None,
            skip_compression: vec![default_skip_compression_predicate()],
            max_files: 0,
            progress: None,
            zstd_level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl WriterOptions {
    fn effective_max_files(&self) -> i64 {
        if self.max_files == 0 {
            DEFAULT_MAX_FILES
        } else {
            self.max_files
        }
    }
}

/// The default predicate named in the design document: skip compression
/// for files under [`DEFAULT_SKIP_COMPRESSION_THRESHOLD`] bytes, or whose
/// extension is already-compressed.
pub fn default_skip_compression_predicate() -> SkipCompressionPredicate {
    Arc::new(|path: &str, stat: &std::fs::Metadata| {
        if stat.len() < DEFAULT_SKIP_COMPRESSION_THRESHOLD {
            return true;
        }
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some(ext) => DEFAULT_SKIP_COMPRESSION_EXTENSIONS
                .iter()
                .any(|denied| denied.eq_ignore_ascii_case(ext)),
            None => false,
        }
    })
}

#[derive(Debug, Clone)]
pub struct WriteSummary {
    pub entry_count: usize,
    pub data_size: u64,
    pub data_hash: crate::digest::FileDigest,
}

struct CountingWriter<'a, W> {
    inner: &'a mut W,
    count: u64,
}

impl<'a, W: AsyncWrite + Unpin> CountingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, count: 0 }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

impl<'a, W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<'a, W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let ret = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &ret {
            this.count += *n as u64;
        }
        ret
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

struct CollectedFile {
    rel_path: String,
    abs_path: PathBuf,
}

/// Walks `src_dir`, following no symlinks, and returns every regular file
/// found, sorted lexicographically by slash-normalized relative path. A
/// symlink that resolves to a target inside `src_dir` is silently skipped,
/// matching the archive's documented non-preservation of link entries; one
/// that escapes the rooted tree (or cannot be resolved at all, e.g. a
/// broken link) cannot be silently dropped without changing what the
/// archive claims to contain, so it surfaces as [`Error::Symlink`].
fn collect_files(src_dir: &Path, max_files: i64) -> Result<Vec<CollectedFile>, Error> {
    let root = src_dir.canonicalize()?;
    let mut files = Vec::new();
    for entry in WalkDir::new(src_dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            Error::from(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            match entry.path().canonicalize() {
                Ok(resolved) if resolved.starts_with(&root) => {
                    tracing::debug!(path = %entry.path().display(), "skipping in-tree symlink");
                }
                _ => return Err(Error::Symlink(entry.path().to_path_buf())),
            }
            continue;
        }
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .expect("walkdir entries are always under the root");
        let rel_str = rel
            .to_str()
            .ok_or_else(|| Error::Invalid {
                op: "writer::create",
                path: rel.display().to_string(),
                reason: "path is not valid UTF-8".to_string(),
            })?
            .replace(std::path::MAIN_SEPARATOR, "/");

        crate::path::validate("writer::create", &rel_str)?;

        if max_files >= 0 && files.len() as i64 >= max_files {
            return Err(Error::TooManyFiles { limit: max_files });
        }

        files.push(CollectedFile {
            rel_path: rel_str,
            abs_path: entry.into_path(),
        });
    }

    files.sort_by(|a, b| a.rel_path.as_bytes().cmp(b.rel_path.as_bytes()));
    Ok(files)
}

#[cfg(unix)]
fn owner_and_mode(stat: &std::fs::Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (stat.mode() & 0o7777, stat.uid(), stat.gid())
}

#[cfg(not(unix))]
fn owner_and_mode(_stat: &std::fs::Metadata) -> (u32, u32, u32) {
    (0o644, 0, 0)
}

fn mtime_parts(stat: &std::fs::Metadata) -> Result<(i64, u32), Error> {
    let modified = stat.modified().map_err(Error::Io)?;
    match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => Ok((u64_to_i64(d.as_secs(), "mtime")?, d.subsec_nanos())),
        Err(e) => {
            // Before the epoch: store as a negative second count, zero nanos.
            let d = e.duration();
            Ok((-u64_to_i64(d.as_secs(), "mtime")?, 0))
        }
    }
}

fn change_signature(stat: &std::fs::Metadata) -> Result<(u64, i64, u32, u32), Error> {
    let (secs, nanos) = mtime_parts(stat)?;
    let (mode, _uid, _gid) = owner_and_mode(stat);
    Ok((stat.len(), secs, nanos, mode))
}

struct RawEntry {
    path: String,
    data_offset: u64,
    data_size: u64,
    original_size: u64,
    hash: [u8; 32],
    mode: u32,
    uid: u32,
    gid: u32,
    mtime_secs: i64,
    mtime_nanos: u32,
    compression: Compression,
}

/// Streams `src_dir` into `index_sink` and `data_sink` per the writer
/// algorithm: walk in sorted order, stream each file through a hashing +
/// optional-compressing tee, then serialize the index.
#[tracing::instrument(skip(index_sink, data_sink, options, cancel), fields(src_dir = %src_dir.display()))]
pub async fn create<W1, W2>(
    src_dir: &Path,
    mut index_sink: W1,
    data_sink: W2,
    options: &WriterOptions,
    cancel: CancellationToken,
) -> Result<WriteSummary, Error>
where
    W1: AsyncWrite + Unpin,
    W2: AsyncWrite + Unpin,
{
    let max_files = options.effective_max_files();
    let files = collect_files(src_dir, max_files)?;

    let mut data_sink = HashingWriter::new(data_sink);
    let mut raw_entries: Vec<RawEntry> = Vec::with_capacity(files.len());
    let mut offset: u64 = 0;

    for file in &files {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        if let Some(progress) = &options.progress {
            progress(&file.rel_path);
        }

        let handle = tokio::fs::File::open(&file.abs_path).await?;
        let stat_before = handle.metadata().await?;

        let skip_compression = options
            .skip_compression
            .iter()
            .any(|pred| pred(&file.rel_path, &stat_before));
        let compression = if skip_compression {
            Compression::None
        } else {
            options.compression
        };

        let hashing = HashingReader::new(handle);
        let mut counting = CountingWriter::new(&mut data_sink);

        let (original_size, data_size, file_back, content_hash) = match compression {
            Compression::None => {
                let mut hashing = hashing;
                let original_size = tokio::io::copy(&mut hashing, &mut counting).await?;
                counting.flush().await?;
                let data_size = counting.count();
                let (file_back, content_hash) = hashing.into_parts();
                (original_size, data_size, file_back, content_hash)
            }
            Compression::Zstd => {
                let mut hashing = hashing;
                let mut encoder = ZstdEncoder::with_quality(counting, Level::Precise(options.zstd_level));
                let original_size = tokio::io::copy(&mut hashing, &mut encoder).await?;
                encoder.shutdown().await?;
                let data_size = encoder.into_inner().count();
                let (file_back, content_hash) = hashing.into_parts();
                (original_size, data_size, file_back, content_hash)
            }
        };

        if original_size != stat_before.len() {
            return Err(std::io::Error::other(format!(
                "{}: file size changed while reading (expected {}, read {})",
                file.rel_path,
                stat_before.len(),
                original_size
            ))
            .into());
        }

        if options.change_detection == ChangeDetection::Strict {
            let stat_after = file_back.metadata().await?;
            if change_signature(&stat_before)? != change_signature(&stat_after)? {
                return Err(std::io::Error::other(format!(
                    "{}: file changed during read (strict change detection)",
                    file.rel_path
                ))
                .into());
            }
        }

        let (mode, uid, gid) = owner_and_mode(&stat_before);
        let (mtime_secs, mtime_nanos) = mtime_parts(&stat_before)?;

        let next_offset = checked_add(offset, data_size, "writer data offset")?;
        raw_entries.push(RawEntry {
            path: file.rel_path.clone(),
            data_offset: offset,
            data_size,
            original_size,
            hash: *content_hash.as_bytes(),
            mode,
            uid,
            gid,
            mtime_secs,
            mtime_nanos,
            compression,
        });
        offset = next_offset;
    }

    data_sink.flush().await?;
    let data_size_total = offset;
    let data_hash = data_sink.finalize();

    let encode_entries: Vec<EncodeEntry<'_>> = raw_entries
        .iter()
        .map(|e| EncodeEntry {
            path: &e.path,
            data_offset: e.data_offset,
            data_size: e.data_size,
            original_size: e.original_size,
            hash: e.hash,
            mode: e.mode,
            uid: e.uid,
            gid: e.gid,
            mtime_secs: e.mtime_secs,
            mtime_nanos: e.mtime_nanos,
            compression: e.compression.code(),
        })
        .collect();

    let index_buf = codec::encode(&encode_entries, Some(data_size_total), Some(*data_hash.as_bytes()));
    index_sink.write_all(&index_buf).await?;
    index_sink.flush().await?;

    Ok(WriteSummary {
        entry_count: raw_entries.len(),
        data_size: data_size_total,
        data_hash,
    })
}

#[cfg(test)]
mod tests {
    use crate::index::Index;

    use super::*;

    async fn run_create(dir: &Path, options: &WriterOptions) -> (bytes::Bytes, bytes::Bytes, WriteSummary) {
        let mut index_buf = Vec::new();
        let mut data_buf = Vec::new();
        let summary = create(dir, &mut index_buf, &mut data_buf, options, CancellationToken::new())
            .await
            .unwrap();
        (bytes::Bytes::from(index_buf), bytes::Bytes::from(data_buf), summary)
    }

    #[tokio::test]
    async fn round_trip_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"content of a").await.unwrap();
        tokio::fs::write(dir.path().join("b.txt"), b"content of b").await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub/deep")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/c.txt"), b"content of c").await.unwrap();
        tokio::fs::write(dir.path().join("sub/deep/d.go"), b"package main").await.unwrap();

        let (index_buf, data_buf, summary) = run_create(dir.path(), &WriterOptions::default()).await;
        assert_eq!(summary.entry_count, 4);

        let index = Index::load(index_buf).unwrap();
        let paths: Vec<_> = index.entries_view().map(|v| v.path().unwrap().to_owned()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "sub/c.txt", "sub/deep/d.go"]);

        let expected: std::collections::HashMap<&str, &[u8]> = [
            ("a.txt", &b"content of a"[..]),
            ("b.txt", &b"content of b"[..]),
            ("sub/c.txt", &b"content of c"[..]),
            ("sub/deep/d.go", &b"package main"[..]),
        ]
        .into_iter()
        .collect();

        for view in index.entries_view() {
            let path = view.path().unwrap().to_owned();
            let range = view.data_offset() as usize..(view.data_offset() + view.data_size()) as usize;
            assert_eq!(&data_buf[range], expected[path.as_str()]);
        }
    }

    #[tokio::test]
    async fn compression_shrinks_compressible_content() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"hello world ".repeat(1000);
        tokio::fs::write(dir.path().join("test.txt"), &content).await.unwrap();

        let options = WriterOptions {
            compression: Compression::Zstd,
            skip_compression: vec![],
            ..WriterOptions::default()
        };
        let (index_buf, data_buf, _summary) = run_create(dir.path(), &options).await;

        let index = Index::load(index_buf).unwrap();
        let view = index.lookup_view("test.txt").unwrap();
        assert!(view.data_size() < view.original_size());

        let compressed = &data_buf[view.data_offset() as usize..(view.data_offset() + view.data_size()) as usize];
        let decoded = zstd::decode_all(compressed).unwrap();
        assert_eq!(decoded, content);
        assert_eq!(crate::digest::FileDigest::of(&content), view.hash());
    }

    #[tokio::test]
    async fn symlink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("real.txt"), b"real content").await.unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt")).unwrap();
        }

        let (index_buf, _data_buf, summary) = run_create(dir.path(), &WriterOptions::default()).await;
        assert_eq!(summary.entry_count, 1);
        let index = Index::load(index_buf).unwrap();
        assert!(index.lookup_view("real.txt").is_some());
        assert!(index.lookup_view("link.txt").is_none());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn symlink_escaping_the_source_root_is_reported() {
        let outside = tempfile::tempdir().unwrap();
        tokio::fs::write(outside.path().join("secret.txt"), b"not part of the tree").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt")).unwrap();

        let mut index_buf = Vec::new();
        let mut data_buf = Vec::new();
        let err = create(dir.path(), &mut index_buf, &mut data_buf, &WriterOptions::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Symlink(_)));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn broken_symlink_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(dir.path().join("does-not-exist.txt"), dir.path().join("link.txt")).unwrap();

        let mut index_buf = Vec::new();
        let mut data_buf = Vec::new();
        let err = create(dir.path(), &mut index_buf, &mut data_buf, &WriterOptions::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Symlink(_)));
    }

    #[tokio::test]
    async fn too_many_files_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            tokio::fs::write(dir.path().join(format!("f{i}.txt")), b"x").await.unwrap();
        }
        let options = WriterOptions {
            max_files: 3,
            ..WriterOptions::default()
        };
        let mut index_buf = Vec::new();
        let mut data_buf = Vec::new();
        let err = create(dir.path(), &mut index_buf, &mut data_buf, &options, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManyFiles { limit: 3 }));
    }

    #[tokio::test]
    async fn cancellation_before_any_file_aborts() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            tokio::fs::write(dir.path().join(format!("f{i}.txt")), b"x").await.unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut index_buf = Vec::new();
        let mut data_buf = Vec::new();
        let err = create(dir.path(), &mut index_buf, &mut data_buf, &WriterOptions::default(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Canceled));
        assert!(index_buf.is_empty());
    }
}
