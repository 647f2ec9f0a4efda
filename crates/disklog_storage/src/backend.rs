//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level storage backend for DiskLog.
///
/// Storage backends are **opaque byte stores**. They provide simple operations
/// for reading, appending, flushing and truncating data. DiskLog owns all file
/// format interpretation - backends do not understand segment headers or
/// records.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset,
///   once they have been flushed
/// - `flush` hands all appended data to the operating system
/// - `sync` additionally makes it durable
/// - Backends must be `Send + Sync` for concurrent access
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written. The data may be staged
    /// in memory until the next [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is read-only or an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Writes any staged data to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// For writable backends this includes staged bytes. For read-only
    /// backends it reflects the live on-disk size, so growth by another
    /// writer becomes visible.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Flushes and syncs all data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to the given size.
    ///
    /// This removes all data after the specified offset. It is used by
    /// crash recovery and log trimming.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The truncation fails
    /// - `new_size` is greater than current size
    /// - The backend is read-only
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
