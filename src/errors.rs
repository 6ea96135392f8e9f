use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::path::PathError;

/// The crate-wide error taxonomy described in the design document.
///
/// Narrower errors (path validation, index parsing) convert into this type
/// via `From` so callers only ever need to match on one enum. `Clone` is
/// derived (with I/O errors held behind an `Arc`) so the cache's
/// single-flight layer can hand the same error to every waiter on a
/// coalesced fetch.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("hash mismatch for {path:?}: expected {expected}, got {actual}")]
    HashMismatch {
        path: Option<String>,
        expected: String,
        actual: String,
    },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("size overflow: {0}")]
    SizeOverflow(String),

    #[error("symlink encountered at {0:?}")]
    Symlink(PathBuf),

    #[error("too many files: limit is {limit}")]
    TooManyFiles { limit: i64 },

    #[error("path {path:?} not found ({op})")]
    NotExist { op: &'static str, path: String },

    #[error("invalid path {path:?} ({op}): {reason}")]
    Invalid {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("operation canceled")]
    Canceled,

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("index error: {0}")]
    Index(#[from] crate::index::codec::IndexError),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<PathError> for Error {
    fn from(value: PathError) -> Self {
        match value.kind {
            crate::path::PathErrorKind::Invalid(reason) => Error::Invalid {
                op: value.op,
                path: value.path,
                reason,
            },
            crate::path::PathErrorKind::NotExist => Error::NotExist {
                op: value.op,
                path: value.path,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
