//! Error types for the disk-backed spatial index.

use std::io;
use thiserror::Error;

/// Errors raised by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The file is not an index file, or its format version is unsupported.
    /// Raised before any node is read; there is no implicit migration.
    #[error("index format error: {0}")]
    Format(String),

    /// A structural invariant was violated during traversal (corruption).
    /// Fatal for the current operation.
    #[error("structural error: {0}")]
    Structural(String),

    /// An underlying storage failure, propagated unwrapped.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// Dimension mismatch, invalid options, or use of a closed tree.
    #[error("invalid argument: {0}")]
    Argument(String),
}

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

impl IndexError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        IndexError::Format(msg.into())
    }

    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        IndexError::Structural(msg.into())
    }

    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        IndexError::Argument(msg.into())
    }

    pub(crate) fn closed() -> Self {
        IndexError::Argument("tree is closed".into())
    }
}
