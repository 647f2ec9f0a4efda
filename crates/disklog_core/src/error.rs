//! Error types for DiskLog core.

use disklog_storage::StorageError;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur in DiskLog operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Storage failure, annotated with the file and byte offset involved.
    #[error("storage error on {} at offset {offset}: {source}", path.display())]
    Storage {
        /// File being accessed.
        path: PathBuf,
        /// Byte offset of the failed operation.
        offset: u64,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },

    /// Directory-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record declared a length that cannot be valid.
    #[error("corrupt record length {length} at offset {offset} in {file}")]
    CorruptLength {
        /// Segment file name.
        file: String,
        /// Offset of the record.
        offset: u64,
        /// Declared length.
        length: u64,
    },

    /// Stored and computed record checksums differ.
    #[error(
        "checksum mismatch at offset {offset} in {file}: stored {stored:#x}, computed {computed:#x}"
    )]
    ChecksumMismatch {
        /// Segment file name.
        file: String,
        /// Offset of the record.
        offset: u64,
        /// Checksum stored in the record.
        stored: u64,
        /// Checksum computed from the record data.
        computed: u64,
    },

    /// A record passed framing checks but its contents are malformed.
    #[error("corrupt record at offset {offset}: {message}")]
    CorruptRecord {
        /// Offset of the record.
        offset: u64,
        /// Description of the problem.
        message: String,
    },

    /// A segment header is missing or malformed.
    #[error("invalid segment header in {file}: {message}")]
    InvalidHeader {
        /// Segment file name.
        file: String,
        /// Description of the problem.
        message: String,
    },

    /// The index or segment files violate a log invariant.
    #[error("log consistency error: {message}")]
    LogConsistency {
        /// Description of the violation.
        message: String,
    },

    /// A writer supplied a non-monotonic position.
    #[error("sequence order violation: {message}")]
    SequenceOrder {
        /// Description of the violation.
        message: String,
    },

    /// A blocking wait exceeded its budget.
    #[error("timed out after {waited:?} waiting for {waiting_for}")]
    Timeout {
        /// What the caller was waiting for.
        waiting_for: String,
        /// How long the wait lasted.
        waited: Duration,
    },

    /// Read or write attempted before a successful seek.
    #[error("connection is not positioned; call seek first")]
    NotPositioned,

    /// Write attempted through a read-only connection or log.
    #[error("not writable: {message}")]
    NotWritable {
        /// Why the write was refused.
        message: String,
    },

    /// Operation on a released connection or log.
    #[error("connection or log has already been released")]
    AlreadyReleased,

    /// A second write connection was requested.
    #[error("a write connection is already open on this log")]
    WriterAlreadyExists,

    /// A deletion range is not anchored at either end of the log.
    #[error("invalid delete range: {message}")]
    InvalidRange {
        /// Description of the problem.
        message: String,
    },

    /// Configuration value rejected.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Event serialization or deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },
}

impl LogError {
    /// Wraps a storage error with file and offset context.
    pub fn storage(path: &Path, offset: u64, source: StorageError) -> Self {
        Self::Storage {
            path: path.to_path_buf(),
            offset,
            source,
        }
    }

    /// Creates a log consistency error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::LogConsistency {
            message: message.into(),
        }
    }

    /// Creates a sequence order error.
    pub fn sequence_order(message: impl Into<String>) -> Self {
        Self::SequenceOrder {
            message: message.into(),
        }
    }

    /// Creates a not-writable error.
    pub fn not_writable(message: impl Into<String>) -> Self {
        Self::NotWritable {
            message: message.into(),
        }
    }

    /// Creates an invalid header error.
    pub fn invalid_header(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Creates a corrupt record error.
    pub fn corrupt_record(offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid range error.
    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::InvalidRange {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(waiting_for: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            waiting_for: waiting_for.into(),
            waited,
        }
    }

    /// Returns true for record-level corruption.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptLength { .. }
                | Self::ChecksumMismatch { .. }
                | Self::CorruptRecord { .. }
        )
    }

    /// Returns true if the caller may retry the operation.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
