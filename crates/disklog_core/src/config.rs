//! Log configuration.

use crate::error::{LogError, LogResult};
use crate::record::ChecksumKind;
use crate::serializer;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for opening a [`DiskLog`](crate::DiskLog).
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding segment files and the lock file.
    pub log_dir: PathBuf,

    /// Size in bytes after which the active segment is rotated.
    pub max_segment_size: u64,

    /// Whether records carry a CRC-32 checksum.
    pub checksums: bool,

    /// How long a blocking read waits for new data.
    pub read_timeout: Duration,

    /// How long a reader waits for a rotated-to segment to appear.
    pub rotate_timeout: Duration,

    /// Read connections idle longer than this are released.
    pub idle_timeout: Duration,

    /// Segments older than this become eligible for purge (None = keep all).
    pub retention: Option<Duration>,

    /// Buffer size for segment reads and writes.
    pub buffer_size: usize,

    /// Background flush interval (zero = flush on every write).
    pub flush_interval: Duration,

    /// Whether flushes also fsync.
    pub fsync_on_flush: bool,

    /// Open without taking the write lock.
    pub read_only: bool,

    /// Name of the event serializer.
    pub serializer: String,

    /// Largest record length accepted when reading.
    pub max_record_size: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("disklog"),
            max_segment_size: 100_000_000,
            checksums: true,
            read_timeout: Duration::from_secs(60),
            rotate_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(8 * 60 * 60),
            retention: None,
            buffer_size: 128 * 1024,
            flush_interval: Duration::ZERO,
            fsync_on_flush: false,
            read_only: false,
            serializer: serializer::DEFAULT_SERIALIZER.to_string(),
            max_record_size: 256 * 1024 * 1024,
        }
    }
}

impl LogConfig {
    /// Creates a configuration for the given directory with default values.
    #[must_use]
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the segment rotation size.
    #[must_use]
    pub const fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Enables or disables record checksums.
    #[must_use]
    pub const fn checksums(mut self, value: bool) -> Self {
        self.checksums = value;
        self
    }

    /// Sets the blocking read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the rotation-follow timeout.
    #[must_use]
    pub const fn rotate_timeout(mut self, timeout: Duration) -> Self {
        self.rotate_timeout = timeout;
        self
    }

    /// Sets the idle read connection timeout.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub const fn retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the I/O buffer size.
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the background flush interval.
    #[must_use]
    pub const fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets whether flushes fsync.
    #[must_use]
    pub const fn fsync_on_flush(mut self, value: bool) -> Self {
        self.fsync_on_flush = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the serializer name.
    #[must_use]
    pub fn serializer(mut self, name: impl Into<String>) -> Self {
        self.serializer = name.into();
        self
    }

    /// Sets the record length ceiling.
    #[must_use]
    pub const fn max_record_size(mut self, size: u32) -> Self {
        self.max_record_size = size;
        self
    }

    /// Checksum strategy implied by this configuration.
    #[must_use]
    pub fn checksum_kind(&self) -> ChecksumKind {
        if self.checksums {
            ChecksumKind::Crc32
        } else {
            ChecksumKind::None
        }
    }

    /// Returns true when writes rely on the background flush task.
    #[must_use]
    pub fn async_flush(&self) -> bool {
        !self.flush_interval.is_zero()
    }

    /// Checks that all values are usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first bad value.
    pub fn validate(&self) -> LogResult<()> {
        if self.max_segment_size == 0 {
            return Err(LogError::invalid_config("max_segment_size must be positive"));
        }
        if self.buffer_size == 0 {
            return Err(LogError::invalid_config("buffer_size must be positive"));
        }
        if (self.max_record_size as usize) < crate::record::MIN_RECORD_LENGTH {
            return Err(LogError::invalid_config(format!(
                "max_record_size must be at least {} bytes",
                crate::record::MIN_RECORD_LENGTH
            )));
        }
        if !serializer::is_known(&self.serializer) {
            return Err(LogError::invalid_config(format!(
                "unknown serializer: {}",
                self.serializer
            )));
        }
        Ok(())
    }
}
