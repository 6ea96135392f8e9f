//! The parsed, queryable view over an index blob.
//!
//! [`Index::load`] is the only allocating step (beyond the buffer itself,
//! which the caller hands over). Everything afterwards — [`Index::lookup_view`],
//! [`Index::entries_view`], [`Index::entries_with_prefix_view`] — reads
//! directly out of the shared buffer through [`EntryView`].

pub mod codec;

use std::sync::Arc;

use bytes::Bytes;

use self::codec::{parse_header, IndexError, ParsedHeader, Record, HEADER_LEN, RECORD_LEN};
use crate::digest::FileDigest;
use crate::entry::{Compression, Entry};

struct IndexInner {
    buf: Bytes,
    header: ParsedHeader,
    pool_offset: usize,
}

/// A parsed index: a versioned, sorted table of [`Entry`] records over a
/// shared, immutable buffer. Cheap to clone (an `Arc` bump) and safe to
/// share across reader, file handles and the batch processor.
#[derive(Clone)]
pub struct Index(Arc<IndexInner>);

impl Index {
    /// Parses `buf` as an index blob. Validates the header and that the
    /// entry table fits; does not validate individual path bytes or that
    /// `data_offset`s are non-overlapping — those are checked lazily (path
    /// bytes, on access) or are the writer's responsibility to get right in
    /// the first place (offset monotonicity).
    #[tracing::instrument(skip_all, fields(buf.len = buf.len()), err)]
    pub fn load(buf: Bytes) -> Result<Self, IndexError> {
        let header = parse_header(&buf)?;

        let records_len = header.entry_count as usize * RECORD_LEN;
        let pool_offset = HEADER_LEN + records_len;
        if buf.len() < pool_offset {
            return Err(IndexError::TruncatedEntryTable);
        }

        Ok(Index(Arc::new(IndexInner {
            buf,
            header,
            pool_offset,
        })))
    }

    pub fn len(&self) -> usize {
        self.0.header.entry_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u32 {
        self.0.header.version
    }

    pub fn data_size(&self) -> Option<u64> {
        self.0.header.data_size
    }

    pub fn data_hash(&self) -> Option<FileDigest> {
        self.0.header.data_hash.map(FileDigest::from)
    }

    fn record_at(&self, idx: u32) -> Record {
        let start = HEADER_LEN + idx as usize * RECORD_LEN;
        Record::read(&self.0.buf[start..start + RECORD_LEN])
    }

    fn path_bytes_for(&self, record: &Record) -> Result<&[u8], IndexError> {
        let start = self.0.pool_offset + record.path_offset as usize;
        let end = start + record.path_len as usize;
        self.0
            .buf
            .get(start..end)
            .ok_or(IndexError::TruncatedPath)
    }

    fn compare_path(&self, idx: u32, target: &[u8]) -> std::cmp::Ordering {
        let record = self.record_at(idx);
        match self.path_bytes_for(&record) {
            Ok(bytes) => bytes.cmp(target),
            // A corrupted path sorts as empty; the corruption itself
            // surfaces when the caller dereferences that entry's path.
            Err(_) => [].cmp(target),
        }
    }

    /// Index of the first entry whose path is >= `target`, or `len()` if
    /// none.
    fn lower_bound(&self, target: &[u8]) -> u32 {
        let mut lo = 0u32;
        let mut hi = self.len() as u32;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.compare_path(mid, target) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Binary search for the unique entry with `path == path`.
    #[tracing::instrument(skip(self), fields(path))]
    pub fn lookup_view(&self, path: &str) -> Option<EntryView> {
        let idx = self.lower_bound(path.as_bytes());
        if idx >= self.len() as u32 {
            return None;
        }
        let view = EntryView {
            index: self.clone(),
            idx,
        };
        if view.path_bytes() == Ok(path.as_bytes()) {
            Some(view)
        } else {
            None
        }
    }

    /// Every entry, in sorted path order.
    pub fn entries_view(&self) -> impl Iterator<Item = EntryView> + '_ {
        (0..self.len() as u32).map(move |idx| EntryView {
            index: self.clone(),
            idx,
        })
    }

    /// Every entry whose path begins with `prefix`, in sorted path order.
    /// An empty prefix yields every entry.
    #[tracing::instrument(skip(self), fields(prefix))]
    pub fn entries_with_prefix_view<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = EntryView> + 'a {
        let start = self.lower_bound(prefix.as_bytes());
        (start..self.len() as u32)
            .map(move |idx| EntryView {
                index: self.clone(),
                idx,
            })
            .take_while(move |view| {
                view.path_bytes()
                    .map(|bytes| bytes.starts_with(prefix.as_bytes()))
                    .unwrap_or(false)
            })
    }
}

/// A zero-copy (modulo the cheap `Arc` bump in [`Index::clone`]) handle
/// into one record of the index buffer. Path and hash accessors alias the
/// index's buffer and are only meaningful while the index they came from
/// is alive; materialize an owned [`Entry`] with [`EntryView::to_entry`] to
/// outlive that.
#[derive(Clone)]
pub struct EntryView {
    index: Index,
    idx: u32,
}

impl EntryView {
    fn record(&self) -> Record {
        self.index.record_at(self.idx)
    }

    pub fn path_bytes(&self) -> Result<&[u8], IndexError> {
        // record_at() is cheap (a fixed-offset read); recomputing it here
        // instead of caching keeps EntryView a plain (Index, u32) pair.
        let record = self.index.record_at(self.idx);
        let start = self.index.0.pool_offset + record.path_offset as usize;
        let end = start + record.path_len as usize;
        self.index
            .0
            .buf
            .get(start..end)
            .ok_or(IndexError::TruncatedPath)
    }

    pub fn path(&self) -> Result<&str, IndexError> {
        std::str::from_utf8(self.path_bytes()?).map_err(|_| IndexError::InvalidUtf8)
    }

    pub fn hash_bytes(&self) -> [u8; 32] {
        self.record().hash
    }

    pub fn hash(&self) -> FileDigest {
        FileDigest::from(self.hash_bytes())
    }

    pub fn data_offset(&self) -> u64 {
        self.record().data_offset
    }

    pub fn data_size(&self) -> u64 {
        self.record().data_size
    }

    pub fn original_size(&self) -> u64 {
        self.record().original_size
    }

    pub fn mode(&self) -> u32 {
        self.record().mode
    }

    pub fn uid(&self) -> u32 {
        self.record().uid
    }

    pub fn gid(&self) -> u32 {
        self.record().gid
    }

    pub fn mtime_nanos(&self) -> i128 {
        let record = self.record();
        record.mtime_secs as i128 * 1_000_000_000 + record.mtime_nanos as i128
    }

    /// `None` means the code is outside the known compression range: an
    /// "unknown compression" failure, per the external interface contract.
    pub fn compression(&self) -> Option<Compression> {
        Compression::from_code(self.record().compression)
    }

    /// Copies out an owned [`Entry`]. Fails if the path bytes are
    /// corrupted (truncated or non-UTF-8) or the compression code is
    /// unrecognized.
    pub fn to_entry(&self) -> Result<Entry, IndexError> {
        let path = self.path()?.to_owned();
        let compression = self
            .compression()
            .ok_or(IndexError::UnknownCompression(self.record().compression))?;
        Ok(Entry {
            path,
            data_offset: self.data_offset(),
            data_size: self.data_size(),
            original_size: self.original_size(),
            hash: self.hash(),
            mode: self.mode(),
            uid: self.uid(),
            gid: self.gid(),
            mtime_nanos: self.mtime_nanos(),
            compression,
        })
    }
}
