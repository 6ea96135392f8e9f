//! Pluggable consumers of verified entry bytes: a filesystem extraction
//! sink (temp-file-plus-rename), an in-memory sink, and a cache sink.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::cache::Cache;
use crate::entry::Entry;
use crate::errors::Error;

/// A streaming writer for one entry's verified bytes, committed or
/// discarded once the batch processor knows whether the entry's hash
/// checked out.
#[async_trait]
pub trait Committer: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;
    async fn commit(self: Box<Self>) -> Result<(), Error>;
    async fn discard(self: Box<Self>);
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Whether this entry should be processed at all (lets the cache sink
    /// skip already-cached entries, lets the filesystem sink skip existing
    /// files when overwrite is disabled).
    async fn should_process(&self, entry: &Entry) -> Result<bool, Error>;

    async fn writer(&self, entry: &Entry) -> Result<Box<dyn Committer>, Error>;

    /// Convenience for sinks that would rather take the whole buffer at
    /// once than drive a `Committer`. The default forwards to `writer`.
    async fn put_buffered(&self, entry: &Entry, bytes: Bytes) -> Result<(), Error> {
        let mut writer = self.writer(entry).await?;
        if !bytes.is_empty() {
            writer.write(&bytes).await?;
        }
        writer.commit().await
    }
}

/// Extracts entries onto the local filesystem under `dest_dir`, writing
/// each file to a sibling temp file and renaming it into place so a reader
/// never observes a partially-written file.
pub struct FilesystemSink {
    dest_dir: PathBuf,
    overwrite: bool,
    preserve_mode: bool,
    preserve_mtime: bool,
}

impl FilesystemSink {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            overwrite: true,
            preserve_mode: false,
            preserve_mtime: false,
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_preserve_mode(mut self, preserve: bool) -> Self {
        self.preserve_mode = preserve;
        self
    }

    pub fn with_preserve_mtime(mut self, preserve: bool) -> Self {
        self.preserve_mtime = preserve;
        self
    }

    fn dest_path(&self, entry: &Entry) -> PathBuf {
        self.dest_dir.join(&entry.path)
    }
}

#[async_trait]
impl Sink for FilesystemSink {
    async fn should_process(&self, entry: &Entry) -> Result<bool, Error> {
        if self.overwrite {
            return Ok(true);
        }
        Ok(!tokio::fs::try_exists(self.dest_path(entry)).await?)
    }

    #[tracing::instrument(skip(self), fields(path = %entry.path))]
    async fn writer(&self, entry: &Entry) -> Result<Box<dyn Committer>, Error> {
        let dest = self.dest_path(entry);
        let parent = dest.parent().map(Path::to_owned).unwrap_or_else(|| self.dest_dir.clone());
        tokio::fs::create_dir_all(&parent).await?;

        let tmp_name = format!(".{}.tmp-{}", crate::path::base(&entry.path), std::process::id());
        let tmp_path = parent.join(tmp_name);
        let file = tokio::fs::File::create(&tmp_path).await?;

        Ok(Box::new(FilesystemCommitter {
            tmp_path,
            dest,
            file,
            mode: self.preserve_mode.then_some(entry.mode),
            mtime_nanos: self.preserve_mtime.then_some(entry.mtime_nanos),
        }))
    }

    async fn put_buffered(&self, entry: &Entry, bytes: Bytes) -> Result<(), Error> {
        let mut writer = self.writer(entry).await?;
        if !bytes.is_empty() {
            writer.write(&bytes).await?;
        }
        writer.commit().await
    }
}

struct FilesystemCommitter {
    tmp_path: PathBuf,
    dest: PathBuf,
    file: tokio::fs::File,
    mode: Option<u32>,
    mtime_nanos: Option<i128>,
}

#[async_trait]
impl Committer for FilesystemCommitter {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), Error> {
        self.file.flush().await?;
        drop(self.file);
        tokio::fs::rename(&self.tmp_path, &self.dest).await?;

        #[cfg(unix)]
        if let Some(mode) = self.mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dest, std::fs::Permissions::from_mode(mode)).await?;
        }
        if let Some(mtime_nanos) = self.mtime_nanos {
            let secs = (mtime_nanos / 1_000_000_000) as i64;
            let nanos = (mtime_nanos.rem_euclid(1_000_000_000)) as u32;
            let mtime = filetime::FileTime::from_unix_time(secs, nanos);
            let dest = self.dest.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_mtime(&dest, mtime))
                .await
                .map_err(|e| Error::from(std::io::Error::other(e)))??;
        }
        Ok(())
    }

    async fn discard(self: Box<Self>) {
        drop(self.file);
        let _ = tokio::fs::remove_file(&self.tmp_path).await;
    }
}

/// Buffers extracted entries in memory, keyed by archive path. Used for
/// small extractions and in tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    contents: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.contents.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.contents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn should_process(&self, _entry: &Entry) -> Result<bool, Error> {
        Ok(true)
    }

    async fn writer(&self, entry: &Entry) -> Result<Box<dyn Committer>, Error> {
        Ok(Box::new(MemoryCommitter {
            path: entry.path.clone(),
            buf: Vec::new(),
            contents: self.contents.clone(),
        }))
    }
}

struct MemoryCommitter {
    path: String,
    buf: Vec<u8>,
    contents: Arc<Mutex<HashMap<String, Bytes>>>,
}

#[async_trait]
impl Committer for MemoryCommitter {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.contents.lock().insert(self.path, Bytes::from(self.buf));
        Ok(())
    }

    async fn discard(self: Box<Self>) {}
}

/// Feeds verified entry content into a [`Cache`], keyed by the entry's
/// hash. Used by the reader's prefetch paths.
pub struct CacheSink<C> {
    cache: Arc<C>,
}

impl<C: Cache + 'static> CacheSink<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<C: Cache + 'static> Sink for CacheSink<C> {
    async fn should_process(&self, entry: &Entry) -> Result<bool, Error> {
        Ok(self.cache.get(&entry.hash).await?.is_none())
    }

    async fn writer(&self, entry: &Entry) -> Result<Box<dyn Committer>, Error> {
        Ok(Box::new(CacheCommitter {
            hash: entry.hash.clone(),
            buf: Vec::new(),
            cache: self.cache.clone(),
        }))
    }

    async fn put_buffered(&self, entry: &Entry, bytes: Bytes) -> Result<(), Error> {
        self.cache.put(&entry.hash, bytes).await
    }
}

struct CacheCommitter<C> {
    hash: crate::digest::FileDigest,
    buf: Vec<u8>,
    cache: Arc<C>,
}

#[async_trait]
impl<C: Cache + 'static> Committer for CacheCommitter<C> {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.cache.put(&self.hash, Bytes::from(self.buf)).await
    }

    async fn discard(self: Box<Self>) {}
}
