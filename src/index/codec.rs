//! Binary encoding for the index blob: a fixed header, a flat table of
//! fixed-stride entry records (binary-searchable without touching the
//! string pool), and a trailing pool holding the path bytes the records
//! point into.
//!
//! Everything is little-endian. Field access after [`parse_header`] never
//! allocates: record fields are read directly out of the shared [`Bytes`]
//! buffer the [`crate::index::Index`] keeps alive.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::digest::DIGEST_LEN;

pub const MAGIC: [u8; 4] = *b"RPK1";

/// The format version this codec writes. Readers accept any `version >=
/// min_reader_version` they understand; a future optional field is added
/// after `data_hash` without bumping `min_reader_version`, so old readers
/// simply stop reading before it.
pub const CURRENT_VERSION: u32 = 1;
pub const MIN_SUPPORTED_READER_VERSION: u32 = 1;

pub const HASH_ALGORITHM_SHA256: u8 = 0;

pub const HEADER_LEN: usize = 4 + 4 + 4 + 1 + 4 + 1 + 8 + 1 + DIGEST_LEN;

/// One fixed-stride entry record: see field-by-field breakdown in
/// [`Record::write`] / [`Record::read`].
pub const RECORD_LEN: usize = 4 + 4 + 8 + 8 + 8 + DIGEST_LEN + 4 + 4 + 4 + 8 + 4 + 1 + 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("index buffer is empty")]
    Empty,
    #[error("index buffer too short: need at least {need}, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("bad magic bytes")]
    BadMagic,
    #[error("index requires reader version >= {required}, this reader supports {supported}")]
    UnsupportedVersion { required: u32, supported: u32 },
    #[error("unknown hash algorithm code {0}")]
    UnknownHashAlgorithm(u8),
    #[error("unknown compression code {0}")]
    UnknownCompression(u8),
    #[error("entry table extends past end of buffer")]
    TruncatedEntryTable,
    #[error("entry path extends past end of string pool")]
    TruncatedPath,
    #[error("entry path is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub version: u32,
    pub hash_algorithm: u8,
    pub entry_count: u32,
    pub data_size: Option<u64>,
    pub data_hash: Option<[u8; DIGEST_LEN]>,
}

/// Parses and validates the fixed header. Does not touch the entry table
/// or string pool — corruption there surfaces lazily, the way a defensive
/// but non-scanning parser is expected to behave.
pub fn parse_header(buf: &[u8]) -> Result<ParsedHeader, IndexError> {
    if buf.is_empty() {
        return Err(IndexError::Empty);
    }
    if buf.len() < HEADER_LEN {
        return Err(IndexError::TooShort {
            need: HEADER_LEN,
            got: buf.len(),
        });
    }

    let mut cur = buf;
    let mut magic = [0u8; 4];
    cur.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(IndexError::BadMagic);
    }

    let version = cur.get_u32_le();
    let min_reader_version = cur.get_u32_le();
    if min_reader_version > MIN_SUPPORTED_READER_VERSION {
        return Err(IndexError::UnsupportedVersion {
            required: min_reader_version,
            supported: MIN_SUPPORTED_READER_VERSION,
        });
    }

    let hash_algorithm = cur.get_u8();
    if hash_algorithm != HASH_ALGORITHM_SHA256 {
        return Err(IndexError::UnknownHashAlgorithm(hash_algorithm));
    }

    let entry_count = cur.get_u32_le();

    let data_size_present = cur.get_u8() != 0;
    let data_size_raw = cur.get_u64_le();
    let data_size = data_size_present.then_some(data_size_raw);

    let data_hash_present = cur.get_u8() != 0;
    let mut data_hash_raw = [0u8; DIGEST_LEN];
    cur.copy_to_slice(&mut data_hash_raw);
    let data_hash = data_hash_present.then_some(data_hash_raw);

    Ok(ParsedHeader {
        version,
        hash_algorithm,
        entry_count,
        data_size,
        data_hash,
    })
}

/// A decoded view of one fixed-stride record. Paths are returned as byte
/// ranges into the string pool, not yet sliced, so the caller (the index,
/// which owns the whole buffer) can bounds-check once.
pub struct Record {
    pub path_offset: u32,
    pub path_len: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub original_size: u64,
    pub hash: [u8; DIGEST_LEN],
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub compression: u8,
}

impl Record {
    pub fn read(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= RECORD_LEN);
        let path_offset = buf.get_u32_le();
        let path_len = buf.get_u32_le();
        let data_offset = buf.get_u64_le();
        let data_size = buf.get_u64_le();
        let original_size = buf.get_u64_le();
        let mut hash = [0u8; DIGEST_LEN];
        buf.copy_to_slice(&mut hash);
        let mode = buf.get_u32_le();
        let uid = buf.get_u32_le();
        let gid = buf.get_u32_le();
        let mtime_secs = buf.get_i64_le();
        let mtime_nanos = buf.get_u32_le();
        let compression = buf.get_u8();
        // 3 reserved padding bytes follow; ignored.

        Record {
            path_offset,
            path_len,
            data_offset,
            data_size,
            original_size,
            hash,
            mode,
            uid,
            gid,
            mtime_secs,
            mtime_nanos,
            compression,
        }
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_u32_le(self.path_offset);
        out.put_u32_le(self.path_len);
        out.put_u64_le(self.data_offset);
        out.put_u64_le(self.data_size);
        out.put_u64_le(self.original_size);
        out.put_slice(&self.hash);
        out.put_u32_le(self.mode);
        out.put_u32_le(self.uid);
        out.put_u32_le(self.gid);
        out.put_i64_le(self.mtime_secs);
        out.put_u32_le(self.mtime_nanos);
        out.put_u8(self.compression);
        out.put_bytes(0, 3);
    }
}

/// Input to [`encode`]: already sorted by path, as the writer guarantees.
pub struct EncodeEntry<'a> {
    pub path: &'a str,
    pub data_offset: u64,
    pub data_size: u64,
    pub original_size: u64,
    pub hash: [u8; DIGEST_LEN],
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub compression: u8,
}

/// Serializes a sorted entry list into an index blob.
pub fn encode(
    entries: &[EncodeEntry<'_>],
    data_size: Option<u64>,
    data_hash: Option<[u8; DIGEST_LEN]>,
) -> Bytes {
    let string_pool_len: usize = entries.iter().map(|e| e.path.len()).sum();
    let mut out = BytesMut::with_capacity(
        HEADER_LEN + entries.len() * RECORD_LEN + string_pool_len,
    );

    out.put_slice(&MAGIC);
    out.put_u32_le(CURRENT_VERSION);
    out.put_u32_le(MIN_SUPPORTED_READER_VERSION);
    out.put_u8(HASH_ALGORITHM_SHA256);
    out.put_u32_le(entries.len() as u32);
    out.put_u8(data_size.is_some() as u8);
    out.put_u64_le(data_size.unwrap_or(0));
    out.put_u8(data_hash.is_some() as u8);
    out.put_slice(&data_hash.unwrap_or([0u8; DIGEST_LEN]));

    debug_assert_eq!(out.len(), HEADER_LEN);

    let mut pool_offset: u32 = 0;
    for entry in entries {
        let record = Record {
            path_offset: pool_offset,
            path_len: entry.path.len() as u32,
            data_offset: entry.data_offset,
            data_size: entry.data_size,
            original_size: entry.original_size,
            hash: entry.hash,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            mtime_secs: entry.mtime_secs,
            mtime_nanos: entry.mtime_nanos,
            compression: entry.compression,
        };
        record.write(&mut out);
        pool_offset += entry.path.len() as u32;
    }

    for entry in entries {
        out.put_slice(entry.path.as_bytes());
    }

    out.freeze()
}
