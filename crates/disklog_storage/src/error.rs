//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A mutating operation was attempted on a read-only backend.
    #[error("storage is opened read-only")]
    ReadOnly,

    /// Truncation would grow the storage.
    #[error("cannot truncate to size {requested} which is greater than current size {size}")]
    InvalidTruncate {
        /// The requested new size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },
}
