//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How a [`FileBackend`] was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Positional reads only; size is read from the file system on demand.
    ReadOnly,
    /// Reads, buffered appends, truncation and sync.
    ReadWrite,
}

/// Mutable state guarded by the backend lock.
#[derive(Debug)]
struct Inner {
    file: File,
    /// Bytes handed to the operating system.
    written: u64,
    /// Appended bytes not yet written to the file.
    pending: Vec<u8>,
}

impl Inner {
    fn drain(&mut self) -> StorageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.written))?;
        self.file.write_all(&self.pending)?;
        self.written += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}

/// A file-based storage backend.
///
/// # Durability
///
/// - `append()` stages data in a buffer of `buffer_capacity` bytes and
///   writes it out once the buffer fills
/// - `flush()` writes staged data and calls `File::flush()`
/// - `sync()` flushes and calls `File::sync_data()`
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
/// Internal locking ensures consistent access.
///
/// # Example
///
/// ```no_run
/// use disklog_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open_write(Path::new("data.bin"), 64 * 1024).unwrap();
/// backend.append(b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    access: Access,
    buffer_capacity: usize,
    inner: Mutex<Inner>,
}

impl FileBackend {
    /// Opens an existing file for positional reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_read(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self::from_parts(path, Access::ReadOnly, 0, file, written))
    }

    /// Opens an existing file for reading and appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_write(path: &Path, buffer_capacity: usize) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self::from_parts(
            path,
            Access::ReadWrite,
            buffer_capacity,
            file,
            written,
        ))
    }

    /// Creates a new, empty file opened for reading and appending.
    ///
    /// # Errors
    ///
    /// Returns an error with kind `AlreadyExists` if the file exists, or any
    /// other I/O error raised while creating it.
    pub fn create_new(path: &Path, buffer_capacity: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self::from_parts(
            path,
            Access::ReadWrite,
            buffer_capacity,
            file,
            0,
        ))
    }

    fn from_parts(
        path: &Path,
        access: Access,
        buffer_capacity: usize,
        file: File,
        written: u64,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            access,
            buffer_capacity,
            inner: Mutex::new(Inner {
                file,
                written,
                pending: Vec::with_capacity(buffer_capacity),
            }),
        }
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns how the file was opened.
    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        match self.access {
            Access::ReadWrite => Ok(()),
            Access::ReadOnly => Err(StorageError::ReadOnly),
        }
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let size = match self.access {
            Access::ReadOnly => inner.file.metadata()?.len(),
            Access::ReadWrite => {
                inner.drain()?;
                inner.written
            }
        };
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        inner.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        let offset = inner.written + inner.pending.len() as u64;

        if data.is_empty() {
            return Ok(offset);
        }

        inner.pending.extend_from_slice(data);
        if inner.pending.len() >= self.buffer_capacity {
            inner.drain()?;
        }

        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.access == Access::ReadOnly {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.drain()?;
        inner.file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        let inner = self.inner.lock();
        match self.access {
            Access::ReadOnly => Ok(inner.file.metadata()?.len()),
            Access::ReadWrite => Ok(inner.written + inner.pending.len() as u64),
        }
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        inner.drain()?;
        inner.file.flush()?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        inner.drain()?;

        if new_size > inner.written {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: inner.written,
            });
        }

        inner.file.set_len(new_size)?;
        inner.file.sync_all()?;
        inner.written = new_size;

        Ok(())
    }
}
