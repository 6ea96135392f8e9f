//! A pool of reusable zstd decoder contexts.
//!
//! Constructing a zstd decompression context is comparatively expensive, so
//! both the batch processor (bulk, one-shot decode of an in-memory slice)
//! and the file handle (streaming, incremental decode) borrow contexts from
//! here instead of building one per call. The pool also bounds how many
//! decodes may run at once and how much working memory each one is allowed
//! — the two knobs the design calls out as "configurable memory cap,
//! concurrency, and low-memory mode".

use std::sync::Arc;

use async_compression::tokio::bufread::ZstdDecoder;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::Error;

/// `window_log_max` values corresponding to "ordinary" and "low memory"
/// modes. Bounding the window log bounds the decoder's working-set size,
/// trading rejecting pathological inputs (encoded with a larger window
/// than we're willing to allocate for) for predictable memory use.
const DEFAULT_WINDOW_LOG_MAX: i32 = 27; // 128 MiB
const LOW_MEMORY_WINDOW_LOG_MAX: i32 = 20; // 1 MiB

#[derive(Debug, Clone)]
pub struct DecoderPoolOptions {
    /// Caps the zstd decoder's window size, and therefore its working
    /// memory. `None` uses the library default.
    pub window_log_max: Option<i32>,
    /// How many decodes (bulk or streaming) may be in flight at once.
    pub max_concurrent: usize,
    /// Shorthand for a conservative `window_log_max`, for memory-constrained
    /// hosts. Overridden by an explicit `window_log_max` if both are set.
    pub low_memory: bool,
}

impl Default for DecoderPoolOptions {
    fn default() -> Self {
        Self {
            window_log_max: None,
            max_concurrent: 8,
            low_memory: false,
        }
    }
}

impl DecoderPoolOptions {
    fn effective_window_log_max(&self) -> i32 {
        self.window_log_max.unwrap_or(if self.low_memory {
            LOW_MEMORY_WINDOW_LOG_MAX
        } else {
            DEFAULT_WINDOW_LOG_MAX
        })
    }
}

/// A pool of reusable zstd bulk-decompression contexts, plus a semaphore
/// bounding total concurrent decode work (bulk and streaming alike).
pub struct DecoderPool {
    options: DecoderPoolOptions,
    free: Mutex<Vec<zstd::bulk::Decompressor<'static>>>,
    concurrency: Arc<Semaphore>,
}

impl DecoderPool {
    pub fn new(options: DecoderPoolOptions) -> Self {
        let concurrency = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        Self {
            options,
            free: Mutex::new(Vec::new()),
            concurrency,
        }
    }

    fn new_decompressor(&self) -> Result<zstd::bulk::Decompressor<'static>, Error> {
        let mut d = zstd::bulk::Decompressor::new()
            .map_err(|e| Error::Decompression(format!("failed to create decoder: {e}")))?;
        d.set_parameter(zstd::zstd_safe::DParameter::WindowLogMax(
            self.options.effective_window_log_max() as u32,
        ))
        .map_err(|e| Error::Decompression(format!("failed to configure decoder: {e}")))?;
        Ok(d)
    }

    fn take(&self) -> Result<zstd::bulk::Decompressor<'static>, Error> {
        if let Some(d) = self.free.lock().pop() {
            return Ok(d);
        }
        self.new_decompressor()
    }

    fn give_back(&self, decompressor: zstd::bulk::Decompressor<'static>) {
        self.free.lock().push(decompressor);
    }

    /// Decompresses `compressed` into a freshly-allocated buffer of exactly
    /// `original_size` bytes. Used by the batch processor, which already
    /// knows the exact uncompressed size from the index.
    #[tracing::instrument(skip_all, fields(compressed.len = compressed.len(), original_size), err)]
    pub async fn decompress_buffer(
        &self,
        compressed: &[u8],
        original_size: usize,
    ) -> Result<Vec<u8>, Error> {
        let _permit = self.acquire().await;

        let mut decompressor = self.take()?;
        let mut out = vec![0u8; original_size];
        let result = decompressor.decompress_to_buffer(compressed, &mut out);
        self.give_back(decompressor);

        let n = result.map_err(|e| Error::Decompression(e.to_string()))?;
        if n != original_size {
            return Err(Error::Decompression(format!(
                "decoded {n} bytes, expected {original_size}"
            )));
        }
        Ok(out)
    }

    /// Acquires a concurrency permit without doing any decode work yet.
    /// Used by the streaming path, which holds the permit for the lifetime
    /// of the file handle's decoder rather than a single call.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    /// Wraps `reader` in a streaming zstd decoder, with a permit from this
    /// pool's concurrency budget held for as long as the returned decoder
    /// lives.
    pub async fn open_stream<R>(&self, reader: R) -> StreamingDecoder<R>
    where
        R: AsyncBufRead + Unpin,
    {
        let permit = self.acquire().await;
        StreamingDecoder {
            inner: ZstdDecoder::new(reader),
            _permit: permit,
        }
    }
}

/// Wraps `R` (assumed already buffered) to unbuffered-read callers of
/// [`DecoderPool::open_stream`].
pub fn buffered<R: tokio::io::AsyncRead>(reader: R) -> BufReader<R> {
    BufReader::new(reader)
}

pin_project_lite::pin_project! {
    /// A streaming zstd decoder borrowed from a [`DecoderPool`]'s
    /// concurrency budget. Releases its permit on drop.
    pub struct StreamingDecoder<R: AsyncBufRead> {
        #[pin]
        inner: ZstdDecoder<R>,
        _permit: OwnedSemaphorePermit,
    }
}

impl<R: AsyncBufRead> tokio::io::AsyncRead for StreamingDecoder<R> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    fn compress(data: &[u8]) -> Vec<u8> {
        zstd::encode_all(data, 3).unwrap()
    }

    #[tokio::test]
    async fn bulk_decompress_round_trips() {
        let pool = DecoderPool::new(DecoderPoolOptions::default());
        let original = b"hello world ".repeat(1000);
        let compressed = compress(&original);

        let decoded = pool
            .decompress_buffer(&compressed, original.len())
            .await
            .unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn bulk_decompress_reuses_pooled_decoder() {
        let pool = DecoderPool::new(DecoderPoolOptions::default());
        let original = b"abc".repeat(100);
        let compressed = compress(&original);

        for _ in 0..5 {
            let decoded = pool
                .decompress_buffer(&compressed, original.len())
                .await
                .unwrap();
            assert_eq!(decoded, original);
        }
        // All five calls should have funneled through (and returned) a
        // single pooled decompressor.
        assert_eq!(pool.free.lock().len(), 1);
    }

    #[tokio::test]
    async fn streaming_decode_round_trips() {
        let pool = DecoderPool::new(DecoderPoolOptions::default());
        let original = b"streaming content ".repeat(500);
        let compressed = compress(&original);

        let mut decoder = pool.open_stream(buffered(std::io::Cursor::new(compressed))).await;
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, original);
    }

    #[tokio::test]
    async fn bulk_decompress_size_mismatch_is_an_error() {
        let pool = DecoderPool::new(DecoderPoolOptions::default());
        let original = b"hello".repeat(10);
        let compressed = compress(&original);

        let err = pool.decompress_buffer(&compressed, original.len() + 1).await;
        assert!(err.is_err());
    }
}
