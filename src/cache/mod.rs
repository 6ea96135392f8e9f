//! The content-addressed cache: a basic `get`/`put`/`delete` trait, one
//! in-memory implementation, and a single-flight coalescing wrapper that
//! can sit in front of any `Cache` implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{FutureExt, Shared};
use parking_lot::{Mutex, RwLock};

use crate::digest::FileDigest;
use crate::errors::Error;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, hash: &FileDigest) -> Result<Option<Bytes>, Error>;
    async fn put(&self, hash: &FileDigest, content: Bytes) -> Result<(), Error>;
    async fn delete(&self, hash: &FileDigest) -> Result<(), Error>;
}

/// A cache that can also hand out a streaming writer for a given hash,
/// instead of requiring the full content up front.
#[async_trait]
pub trait StreamingCache: Cache {
    fn writer(&self, hash: FileDigest) -> Box<dyn CacheWriter>;
}

#[async_trait]
pub trait CacheWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;
    /// Makes the written content visible under its hash.
    async fn commit(self: Box<Self>) -> Result<(), Error>;
    /// Abandons the write; the cache must not retain a partial entry.
    async fn discard(self: Box<Self>);
}

/// An in-memory content-addressed map behind a `parking_lot::RwLock`,
/// analogous in shape to a process-local blob-service cache: fine for a
/// single process, with no eviction policy of its own.
#[derive(Clone, Default)]
pub struct MemoryCache {
    map: Arc<RwLock<HashMap<FileDigest, Bytes>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    #[tracing::instrument(skip(self), fields(hash = %hash))]
    async fn get(&self, hash: &FileDigest) -> Result<Option<Bytes>, Error> {
        Ok(self.map.read().get(hash).cloned())
    }

    #[tracing::instrument(skip(self, content), fields(hash = %hash, len = content.len()))]
    async fn put(&self, hash: &FileDigest, content: Bytes) -> Result<(), Error> {
        self.map.write().insert(hash.clone(), content);
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(hash = %hash))]
    async fn delete(&self, hash: &FileDigest) -> Result<(), Error> {
        self.map.write().remove(hash);
        Ok(())
    }
}

#[async_trait]
impl StreamingCache for MemoryCache {
    fn writer(&self, hash: FileDigest) -> Box<dyn CacheWriter> {
        Box::new(MemoryCacheWriter {
            hash,
            buf: Vec::new(),
            map: self.map.clone(),
        })
    }
}

struct MemoryCacheWriter {
    hash: FileDigest,
    buf: Vec<u8>,
    map: Arc<RwLock<HashMap<FileDigest, Bytes>>>,
}

#[async_trait]
impl CacheWriter for MemoryCacheWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.map.write().insert(self.hash, Bytes::from(self.buf));
        Ok(())
    }

    async fn discard(self: Box<Self>) {}
}

type SharedFetch = Shared<std::pin::Pin<Box<dyn std::future::Future<Output = Result<Bytes, Arc<Error>>> + Send>>>;

/// Wraps any [`Cache`] with single-flight coalescing of concurrent misses:
/// at most one live fetch per hash runs at a time, and every concurrent
/// caller for that hash observes the same result.
pub struct CoalescingCache<C> {
    inner: C,
    in_flight: Mutex<HashMap<FileDigest, SharedFetch>>,
}

impl<C: Cache> CoalescingCache<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Returns the cached content for `hash`, or — on a miss — runs
    /// `fetch` (coalesced across concurrent callers for the same hash),
    /// stores the result in the cache (best-effort), and returns it.
    #[tracing::instrument(skip(self, fetch), fields(hash = %hash))]
    pub async fn get_or_fetch<F, Fut>(&self, hash: &FileDigest, fetch: F) -> Result<Bytes, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Bytes, Error>> + Send + 'static,
    {
        if let Some(hit) = self.inner.get(hash).await? {
            return Ok(hit);
        }

        let shared = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(hash) {
                existing.clone()
            } else {
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<Bytes, Arc<Error>>> + Send>> =
                    Box::pin(async move { fetch().await.map_err(Arc::new) });
                let shared = fut.shared();
                in_flight.insert(hash.clone(), shared.clone());
                shared
            }
        };

        let result = shared.await;
        self.in_flight.lock().remove(hash);

        match result {
            Ok(content) => {
                // Best-effort: a cache write failure never fails the read.
                if let Err(e) = self.inner.put(hash, content.clone()).await {
                    tracing::debug!(hash = %hash, error = %e, "cache put failed after coalesced fetch");
                }
                Ok(content)
            }
            Err(e) => Err((*e).clone()),
        }
    }

    /// Verifies a cache hit's content against the hash it was stored
    /// under; on mismatch, purges the poisoned entry and reports
    /// `HashMismatch` rather than returning tampered bytes.
    #[tracing::instrument(skip(self, content), fields(hash = %hash))]
    pub async fn verify_or_purge(&self, hash: &FileDigest, content: Bytes) -> Result<Bytes, Error> {
        let actual = FileDigest::of(&content);
        if actual == *hash {
            return Ok(content);
        }
        let _ = self.inner.delete(hash).await;
        Err(Error::HashMismatch {
            path: None,
            expected: hash.to_string(),
            actual: actual.to_string(),
        })
    }
}

#[async_trait]
impl<C: Cache> Cache for CoalescingCache<C> {
    async fn get(&self, hash: &FileDigest) -> Result<Option<Bytes>, Error> {
        self.inner.get(hash).await
    }

    async fn put(&self, hash: &FileDigest, content: Bytes) -> Result<(), Error> {
        self.inner.put(hash, content).await
    }

    async fn delete(&self, hash: &FileDigest) -> Result<(), Error> {
        self.inner.delete(hash).await
    }
}
