//! The logical record for one archived file.

use crate::digest::FileDigest;

/// How an entry's stored bytes relate to its original content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Zstd = 1,
}

impl Compression {
    /// Decodes a compression code from the index wire format. Returns
    /// `None` (the Rust `Option`, not [`Compression::None`]) for codes
    /// outside the known range, so the caller can fail with "unknown
    /// compression" rather than silently downgrading to uncompressed.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Compression::None),
            1 => Some(Compression::Zstd),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One archived regular file.
///
/// See the data model section of the design document for the invariants
/// entries must satisfy: `data_offset + data_size <= data_blob_size`,
/// `hash.len() == 32`, and `data_size == original_size` whenever
/// `compression == Compression::None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub data_offset: u64,
    pub data_size: u64,
    pub original_size: u64,
    pub hash: FileDigest,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Nanosecond-precision mtime, wall clock from the source filesystem.
    pub mtime_nanos: i128,
    pub compression: Compression,
}

impl Entry {
    pub fn data_range(&self) -> std::ops::Range<u64> {
        self.data_offset..self.data_offset + self.data_size
    }
}
