//! Groups adjacent entries by byte range, issues one fetch per contiguous
//! group, decodes and verifies each entry, and feeds the bytes into a
//! pluggable [`sink::Sink`].

pub mod sink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use self::sink::Sink;
use crate::decompress::DecoderPool;
use crate::digest::FileDigest;
use crate::entry::{Compression, Entry};
use crate::errors::Error;
use crate::sizing;
use crate::source::{read_at_exact, ByteSource};

pub const DEFAULT_READ_AHEAD_GROUPS: usize = 4;
pub const DEFAULT_STREAMING_WORKER_THRESHOLD_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// `0` picks a worker count from a size-based heuristic, `< 0` forces
    /// serial processing, `> 0` is a fixed worker count.
    pub workers: i64,
    /// Bounds how many groups may be fetched and decoded in parallel.
    pub read_ahead_groups: usize,
    /// Below this average entry size, the size-based heuristic falls back
    /// to serial processing rather than paying thread/task overhead.
    pub streaming_worker_threshold_bytes: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            read_ahead_groups: DEFAULT_READ_AHEAD_GROUPS,
            streaming_worker_threshold_bytes: DEFAULT_STREAMING_WORKER_THRESHOLD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub groups: usize,
    pub committed: usize,
    pub bytes_fetched: u64,
}

struct Group {
    start: u64,
    end: u64,
    entries: Vec<Entry>,
}

/// Partitions `entries` (assumed sorted by `data_offset`) into maximal
/// contiguous byte ranges.
fn group_entries(entries: Vec<Entry>) -> Result<Vec<Group>, Error> {
    let mut groups: Vec<Group> = Vec::new();
    for entry in entries {
        let entry_end = sizing::checked_add(entry.data_offset, entry.data_size, "batch group entry end")?;
        match groups.last_mut() {
            Some(g) if entry.data_offset == g.end => {
                g.end = entry_end;
                g.entries.push(entry);
            }
            _ => groups.push(Group {
                start: entry.data_offset,
                end: entry_end,
                entries: vec![entry],
            }),
        }
    }
    Ok(groups)
}

fn effective_concurrency(options: &BatchOptions, entries: &[Entry]) -> usize {
    let worker_count = if options.workers < 0 {
        1
    } else if options.workers > 0 {
        options.workers as usize
    } else {
        let total: u64 = entries.iter().map(|e| e.data_size).sum();
        let avg = total.checked_div(entries.len() as u64).unwrap_or(0);
        if avg < options.streaming_worker_threshold_bytes {
            1
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    };
    worker_count.min(options.read_ahead_groups.max(1)).max(1)
}

pub struct BatchProcessor {
    decoder_pool: Arc<DecoderPool>,
    options: BatchOptions,
}

impl BatchProcessor {
    pub fn new(decoder_pool: Arc<DecoderPool>, options: BatchOptions) -> Self {
        Self { decoder_pool, options }
    }

    /// Filters, groups, fetches, decodes, verifies and commits `entries`
    /// into `sink`. Entries need not already be sorted; they are sorted by
    /// `data_offset` here (a no-op when they already arrive in index order).
    #[tracing::instrument(skip_all, fields(entry_count = entries.len()), err)]
    pub async fn process(
        &self,
        mut entries: Vec<Entry>,
        source: Arc<dyn ByteSource>,
        sink: Arc<dyn Sink>,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, Error> {
        let mut filtered = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if sink.should_process(&entry).await? {
                filtered.push(entry);
            }
        }
        filtered.sort_by(|a, b| a.data_offset.cmp(&b.data_offset));

        if filtered.is_empty() {
            return Ok(BatchSummary::default());
        }

        let concurrency = effective_concurrency(&self.options, &filtered);
        let groups = group_entries(filtered)?;
        let group_count = groups.len();

        let stop = Arc::new(AtomicBool::new(false));
        let bytes_fetched = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let results: Vec<Result<usize, Error>> = stream::iter(groups)
            .map(|group| {
                let source = source.clone();
                let sink = sink.clone();
                let decoder_pool = self.decoder_pool.clone();
                let stop = stop.clone();
                let bytes_fetched = bytes_fetched.clone();
                let cancel = cancel.clone();
                async move {
                    if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        return Err(Error::Canceled);
                    }
                    let result = process_group(&group, source, decoder_pool, sink, &stop, &cancel).await;
                    if result.is_ok() {
                        bytes_fetched.fetch_add(group.end - group.start, Ordering::SeqCst);
                    } else {
                        stop.store(true, Ordering::SeqCst);
                    }
                    result
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut committed = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(n) => committed += n,
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(BatchSummary {
            groups: group_count,
            committed,
            bytes_fetched: bytes_fetched.load(Ordering::SeqCst),
        })
    }
}

async fn process_group(
    group: &Group,
    source: Arc<dyn ByteSource>,
    decoder_pool: Arc<DecoderPool>,
    sink: Arc<dyn Sink>,
    stop: &AtomicBool,
    cancel: &CancellationToken,
) -> Result<usize, Error> {
    let len = sizing::u64_to_usize(group.end - group.start, "batch group length")?;
    let mut buf = vec![0u8; len];
    read_at_exact(source.as_ref(), &mut buf, group.start).await?;

    let mut committed = 0;
    for entry in &group.entries {
        if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let rel_start = sizing::u64_to_usize(entry.data_offset - group.start, "batch entry relative start")?;
        let rel_len = sizing::u64_to_usize(entry.data_size, "batch entry data size")?;
        let slice = buf
            .get(rel_start..rel_start + rel_len)
            .ok_or_else(|| Error::SizeOverflow(format!("{}: entry range exceeds fetched group buffer", entry.path)))?;

        let decoded = match entry.compression {
            Compression::None => slice.to_vec(),
            Compression::Zstd => {
                let original_size = sizing::u64_to_usize(entry.original_size, "batch entry original size")?;
                decoder_pool.decompress_buffer(slice, original_size).await?
            }
        };

        let actual = FileDigest::of(&decoded);
        if actual != entry.hash {
            return Err(Error::HashMismatch {
                path: Some(entry.path.clone()),
                expected: entry.hash.to_string(),
                actual: actual.to_string(),
            });
        }

        let mut writer = sink.writer(entry).await?;
        if !decoded.is_empty() {
            writer.write(&decoded).await?;
        }
        writer.commit().await?;
        committed += 1;
    }

    Ok(committed)
}
