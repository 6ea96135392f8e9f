//! The read-only tree facade: `open`, `stat`, `read_file`, `read_dir`,
//! `copy_to`, `copy_dir`, `entry`, `exists`, `is_file`, `is_dir`,
//! `dir_stats`, `validate_files`.
//!
//! Directories are synthetic: the index stores no directory records, so
//! `stat`/`read_dir`/`is_dir` all derive directory-ness from path prefixes
//! over the sorted entry table.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::batch::sink::{CacheSink, FilesystemSink, Sink};
use crate::batch::{BatchOptions, BatchProcessor};
use crate::cache::{Cache, CoalescingCache};
use crate::decompress::DecoderPool;
use crate::entry::Entry;
use crate::errors::Error;
use crate::handle::{CachedFile, CachingFileHandle, FileHandle, FileInfo};
use crate::index::Index;
use crate::source::ByteSource;

pub const DEFAULT_VERIFY_ON_CLOSE: bool = true;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub verify_on_close: bool,
    pub batch: BatchOptions,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            verify_on_close: DEFAULT_VERIFY_ON_CLOSE,
            batch: BatchOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub overwrite: bool,
    pub preserve_mode: bool,
    pub preserve_mtime: bool,
}

#[derive(Debug, Clone)]
pub struct DirInfo {
    pub name: String,
    pub mode: u32,
}

pub const SYNTHETIC_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub enum Stat {
    File(FileInfo),
    Dir(DirInfo),
}

pub enum OpenHandle {
    /// No cache is configured; a plain streaming handle over the source.
    File(FileHandle),
    /// A cache hit: an in-memory handle over already-verified bytes.
    Cached(CachedFile),
    /// A cache miss: a streaming handle that tees verified bytes into the
    /// cache as the caller drains it.
    Streaming(CachingFileHandle),
    Dir(DirInfo),
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub mode: u32,
    pub mtime_nanos: Option<i128>,
}

#[derive(Debug, Clone, Default)]
pub struct DirStats {
    pub file_count: u64,
    pub total_uncompressed: u64,
    pub total_compressed: u64,
}

fn dir_prefix(name: &str) -> String {
    if name == "." {
        String::new()
    } else {
        format!("{name}/")
    }
}

fn strip_prefix_path(path: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        path.strip_prefix(prefix)
            .map(|rest| rest.strip_prefix('/').unwrap_or(rest))
            .unwrap_or(path)
            .to_string()
    }
}

/// Shares the parsed index, byte source, decoder pool and (optional)
/// content cache with file handles and the batch processor; cheap to
/// clone (every field is reference-counted).
pub struct Reader<C: Cache = crate::cache::MemoryCache> {
    index: Index,
    source: Arc<dyn ByteSource>,
    decoder_pool: Arc<DecoderPool>,
    cache: Option<Arc<CoalescingCache<C>>>,
    options: ReaderOptions,
}

impl<C: Cache> Clone for Reader<C> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            source: self.source.clone(),
            decoder_pool: self.decoder_pool.clone(),
            cache: self.cache.clone(),
            options: self.options.clone(),
        }
    }
}

impl<C: Cache + 'static> Reader<C> {
    pub fn new(
        index: Index,
        source: Arc<dyn ByteSource>,
        decoder_pool: Arc<DecoderPool>,
        cache: Option<Arc<CoalescingCache<C>>>,
        options: ReaderOptions,
    ) -> Self {
        Self {
            index,
            source,
            decoder_pool,
            cache,
            options,
        }
    }

    fn validated<'a>(&self, op: &'static str, name: &'a str) -> Result<&'a str, Error> {
        crate::path::validate(op, name)?;
        Ok(name)
    }

    fn is_synthetic_dir(&self, name: &str) -> bool {
        if name == "." {
            return true;
        }
        self.index.entries_with_prefix_view(&dir_prefix(name)).next().is_some()
    }

    /// Materializes the owned [`Entry`] for `name`, or `None` if no such
    /// file entry exists (which does not rule out `name` being a
    /// synthetic directory).
    #[tracing::instrument(skip(self), fields(name))]
    pub fn entry(&self, name: &str) -> Result<Option<Entry>, Error> {
        let name = self.validated("entry", name)?;
        match self.index.lookup_view(name) {
            Some(view) => Ok(Some(view.to_entry()?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool, Error> {
        let name = self.validated("exists", name)?;
        Ok(self.index.lookup_view(name).is_some() || self.is_synthetic_dir(name))
    }

    pub fn is_file(&self, name: &str) -> Result<bool, Error> {
        let name = self.validated("is_file", name)?;
        Ok(self.index.lookup_view(name).is_some())
    }

    pub fn is_dir(&self, name: &str) -> Result<bool, Error> {
        let name = self.validated("is_dir", name)?;
        Ok(self.is_synthetic_dir(name))
    }

    #[tracing::instrument(skip(self), fields(name))]
    pub fn stat(&self, name: &str) -> Result<Stat, Error> {
        let name = self.validated("stat", name)?;
        if let Some(view) = self.index.lookup_view(name) {
            let entry = view.to_entry()?;
            return Ok(Stat::File(FileInfo {
                name: crate::path::base(&entry.path).to_string(),
                size: entry.original_size,
                mode: entry.mode,
                mtime_nanos: entry.mtime_nanos,
            }));
        }
        if self.is_synthetic_dir(name) {
            return Ok(Stat::Dir(DirInfo {
                name: crate::path::base(name).to_string(),
                mode: SYNTHETIC_DIR_MODE,
            }));
        }
        Err(Error::NotExist {
            op: "stat",
            path: name.to_string(),
        })
    }

    /// Opens `name` for streaming reads. With a cache configured, a hit
    /// returns an in-memory handle over the cached bytes; a miss returns a
    /// streaming handle that tees verified bytes into the cache as the
    /// caller drains it, exactly like [`Reader::read_file`]'s cache path.
    #[tracing::instrument(skip(self), fields(name))]
    pub async fn open(&self, name: &str) -> Result<OpenHandle, Error> {
        let name = self.validated("open", name)?;
        if let Some(view) = self.index.lookup_view(name) {
            let entry = view.to_entry()?;
            let info = FileInfo {
                name: crate::path::base(&entry.path).to_string(),
                size: entry.original_size,
                mode: entry.mode,
                mtime_nanos: entry.mtime_nanos,
            };

            return match &self.cache {
                Some(cache) => {
                    let hash = entry.hash.clone();
                    match cache.get(&hash).await? {
                        Some(content) => {
                            let verified = cache.verify_or_purge(&hash, content).await?;
                            Ok(OpenHandle::Cached(CachedFile::new(info, verified)))
                        }
                        None => {
                            let inner = FileHandle::new(entry, self.source.clone(), self.decoder_pool.clone(), self.options.verify_on_close);
                            let tee: Arc<dyn Cache> = cache.clone();
                            Ok(OpenHandle::Streaming(CachingFileHandle::new(inner, tee, self.options.verify_on_close)))
                        }
                    }
                }
                None => Ok(OpenHandle::File(FileHandle::new(
                    entry,
                    self.source.clone(),
                    self.decoder_pool.clone(),
                    self.options.verify_on_close,
                ))),
            };
        }
        if self.is_synthetic_dir(name) {
            return Ok(OpenHandle::Dir(DirInfo {
                name: crate::path::base(name).to_string(),
                mode: SYNTHETIC_DIR_MODE,
            }));
        }
        Err(Error::NotExist {
            op: "open",
            path: name.to_string(),
        })
    }

    /// Reads, decompresses and verifies a whole file in one call,
    /// consulting the content cache first when one is configured.
    #[tracing::instrument(skip(self), fields(name))]
    pub async fn read_file(&self, name: &str) -> Result<Bytes, Error> {
        let name = self.validated("read_file", name)?;
        let entry = self.index.lookup_view(name).ok_or_else(|| Error::NotExist {
            op: "read_file",
            path: name.to_string(),
        })?.to_entry()?;

        match &self.cache {
            Some(cache) => {
                let hash = entry.hash.clone();
                let content = cache
                    .get_or_fetch(&hash, {
                        let entry = entry.clone();
                        let source = self.source.clone();
                        let decoder_pool = self.decoder_pool.clone();
                        let verify_on_close = self.options.verify_on_close;
                        move || async move { read_whole(entry, source, decoder_pool, verify_on_close).await }
                    })
                    .await?;
                cache.verify_or_purge(&hash, content).await
            }
            None => read_whole(entry, self.source.clone(), self.decoder_pool.clone(), self.options.verify_on_close).await,
        }
    }

    /// Immediate children of `name`, deduplicated by first path component
    /// after the prefix, sorted.
    #[tracing::instrument(skip(self), fields(name))]
    pub fn read_dir(&self, name: &str) -> Result<Vec<DirEntry>, Error> {
        let name = self.validated("read_dir", name)?;
        if name != "." && !self.is_synthetic_dir(name) && self.index.lookup_view(name).is_none() {
            return Err(Error::NotExist {
                op: "read_dir",
                path: name.to_string(),
            });
        }
        if name != "." && self.index.lookup_view(name).is_some() {
            return Err(Error::Invalid {
                op: "read_dir",
                path: name.to_string(),
                reason: "not a directory".to_string(),
            });
        }

        let prefix = dir_prefix(name);
        let component_prefix = if name == "." { "" } else { name };
        let mut children: BTreeMap<String, DirEntry> = BTreeMap::new();
        for view in self.index.entries_with_prefix_view(&prefix) {
            let path = view.path()?;
            let Some(child) = crate::path::child_component_after(path, component_prefix) else {
                continue;
            };
            if children.contains_key(child) {
                continue;
            }
            let is_direct_file = path == format!("{prefix}{child}");
            let entry = if is_direct_file {
                let e = view.to_entry()?;
                DirEntry {
                    name: child.to_string(),
                    is_dir: false,
                    size: Some(e.original_size),
                    mode: e.mode,
                    mtime_nanos: Some(e.mtime_nanos),
                }
            } else {
                DirEntry {
                    name: child.to_string(),
                    is_dir: true,
                    size: None,
                    mode: SYNTHETIC_DIR_MODE,
                    mtime_nanos: None,
                }
            };
            children.insert(child.to_string(), entry);
        }
        Ok(children.into_values().collect())
    }

    /// File count and uncompressed/compressed byte totals for every entry
    /// under `prefix`.
    #[tracing::instrument(skip(self), fields(prefix))]
    pub fn dir_stats(&self, prefix: &str) -> Result<DirStats, Error> {
        let prefix = self.validated("dir_stats", prefix)?;
        let scan_prefix = if prefix == "." { String::new() } else { prefix.to_string() };
        let mut stats = DirStats::default();
        for view in self.index.entries_with_prefix_view(&scan_prefix) {
            stats.file_count += 1;
            stats.total_uncompressed += view.original_size();
            stats.total_compressed += view.data_size();
        }
        Ok(stats)
    }

    /// Verifies each path's stored bytes against its recorded hash
    /// without retaining content.
    #[tracing::instrument(skip(self), fields(path_count = paths.len()))]
    pub async fn validate_files(&self, paths: &[String]) -> Vec<(String, Result<(), Error>)> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let outcome = self.validate_one(path).await;
            results.push((path.clone(), outcome));
        }
        results
    }

    async fn validate_one(&self, path: &str) -> Result<(), Error> {
        let path = self.validated("validate_files", path)?;
        let entry = self.index.lookup_view(path).ok_or_else(|| Error::NotExist {
            op: "validate_files",
            path: path.to_string(),
        })?.to_entry()?;

        let mut handle = FileHandle::new(entry, self.source.clone(), self.decoder_pool.clone(), true);
        let mut buf = [0u8; 8192];
        loop {
            match handle.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
        handle.close().await
    }

    /// Extracts `paths` (files or directories) into `dest_dir`.
    #[tracing::instrument(skip(self), fields(dest = %dest_dir.as_ref().display(), path_count = paths.len()))]
    pub async fn copy_to(
        &self,
        dest_dir: impl AsRef<std::path::Path>,
        paths: &[String],
        options: &CopyOptions,
        cancel: CancellationToken,
    ) -> Result<crate::batch::BatchSummary, Error> {
        let mut entries = Vec::new();
        for path in paths {
            let validated = self.validated("copy_to", path)?;
            if let Some(view) = self.index.lookup_view(validated) {
                entries.push(view.to_entry()?);
            } else if self.is_synthetic_dir(validated) {
                let prefix = dir_prefix(validated);
                for view in self.index.entries_with_prefix_view(&prefix) {
                    let mut entry = view.to_entry()?;
                    entry.path = strip_prefix_path(&entry.path, validated);
                    entries.push(entry);
                }
            } else {
                return Err(Error::NotExist {
                    op: "copy_to",
                    path: validated.to_string(),
                });
            }
        }

        let sink: Arc<dyn Sink> = Arc::new(
            FilesystemSink::new(dest_dir.as_ref())
                .with_overwrite(options.overwrite)
                .with_preserve_mode(options.preserve_mode)
                .with_preserve_mtime(options.preserve_mtime),
        );
        let processor = BatchProcessor::new(self.decoder_pool.clone(), self.options.batch.clone());
        processor.process(entries, self.source.clone(), sink, cancel).await
    }

    /// Extracts every entry under `prefix` into `dest_dir`, writing
    /// `dest_dir/<relative-path-after-prefix>` for each.
    #[tracing::instrument(skip(self), fields(dest = %dest_dir.as_ref().display(), prefix))]
    pub async fn copy_dir(
        &self,
        dest_dir: impl AsRef<std::path::Path>,
        prefix: &str,
        options: &CopyOptions,
        cancel: CancellationToken,
    ) -> Result<crate::batch::BatchSummary, Error> {
        let prefix = self.validated("copy_dir", prefix)?;
        let scan_prefix = if prefix == "." { String::new() } else { prefix.to_string() };

        let mut entries = Vec::new();
        for view in self.index.entries_with_prefix_view(&scan_prefix) {
            let mut entry = view.to_entry()?;
            entry.path = strip_prefix_path(&entry.path, &scan_prefix);
            entries.push(entry);
        }

        let sink: Arc<dyn Sink> = Arc::new(
            FilesystemSink::new(dest_dir.as_ref())
                .with_overwrite(options.overwrite)
                .with_preserve_mode(options.preserve_mode)
                .with_preserve_mtime(options.preserve_mtime),
        );
        let processor = BatchProcessor::new(self.decoder_pool.clone(), self.options.batch.clone());
        processor.process(entries, self.source.clone(), sink, cancel).await
    }

    /// Warms the cache for `paths` (files or directories) without
    /// returning their content: skips entries already cached, groups the
    /// rest through the batch processor, and commits verified bytes into
    /// the cache keyed by hash. Errs if no cache is configured.
    #[tracing::instrument(skip(self), fields(path_count = paths.len()))]
    pub async fn prefetch(&self, paths: &[String], cancel: CancellationToken) -> Result<crate::batch::BatchSummary, Error> {
        let cache = self.cache.as_ref().ok_or(Error::Unsupported("prefetch requires a configured cache"))?;

        let mut entries = Vec::new();
        for path in paths {
            let validated = self.validated("prefetch", path)?;
            if let Some(view) = self.index.lookup_view(validated) {
                entries.push(view.to_entry()?);
            } else if self.is_synthetic_dir(validated) {
                let prefix = dir_prefix(validated);
                for view in self.index.entries_with_prefix_view(&prefix) {
                    entries.push(view.to_entry()?);
                }
            } else {
                return Err(Error::NotExist {
                    op: "prefetch",
                    path: validated.to_string(),
                });
            }
        }

        let sink: Arc<dyn Sink> = Arc::new(CacheSink::new(cache.clone()));
        let processor = BatchProcessor::new(self.decoder_pool.clone(), self.options.batch.clone());
        processor.process(entries, self.source.clone(), sink, cancel).await
    }

    /// Warms the cache for every entry under `prefix`.
    #[tracing::instrument(skip(self), fields(prefix))]
    pub async fn prefetch_dir(&self, prefix: &str, cancel: CancellationToken) -> Result<crate::batch::BatchSummary, Error> {
        let cache = self.cache.as_ref().ok_or(Error::Unsupported("prefetch_dir requires a configured cache"))?;
        let prefix = self.validated("prefetch_dir", prefix)?;
        let scan_prefix = if prefix == "." { String::new() } else { prefix.to_string() };

        let mut entries = Vec::new();
        for view in self.index.entries_with_prefix_view(&scan_prefix) {
            entries.push(view.to_entry()?);
        }

        let sink: Arc<dyn Sink> = Arc::new(CacheSink::new(cache.clone()));
        let processor = BatchProcessor::new(self.decoder_pool.clone(), self.options.batch.clone());
        processor.process(entries, self.source.clone(), sink, cancel).await
    }
}

async fn read_whole(
    entry: Entry,
    source: Arc<dyn ByteSource>,
    decoder_pool: Arc<DecoderPool>,
    verify_on_close: bool,
) -> Result<Bytes, Error> {
    let mut handle = FileHandle::new(entry, source, decoder_pool, verify_on_close);
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match handle.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => return Err(e),
        }
    }
    handle.close().await?;
    Ok(Bytes::from(out))
}
