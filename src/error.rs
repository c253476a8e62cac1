//! Error type shared by every collection engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by segment, entry, and collection operations.
///
/// Retrieval operations that have a natural absent case (`get`, `poll`,
/// `peek`, index lookups without an out-param) do not return this type —
/// they return `Option<T>`. This enum is reserved for the "throw" side of
/// the API (`_or_err` suffixed methods) and for failures that are always
/// errors regardless of call shape (allocation, file, format).
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("index {index} out of bounds (live size {size})")]
    OutOfBounds { index: usize, size: usize },

    #[error("collection is empty")]
    Empty,

    #[error("allocation of {requested} bytes failed even after growth")]
    AllocFailed { requested: usize },

    #[error("file error at {path}: {source}")]
    FileError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format error: {reason}")]
    FormatError { reason: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl Error {
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileError {
            path: path.into(),
            source,
        }
    }

    pub fn format(reason: impl Into<String>) -> Self {
        Error::FormatError {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
