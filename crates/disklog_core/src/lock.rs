//! Cross-process write lock.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lock file name inside the log directory.
pub const LOCK_FILE: &str = "disklog.lck";

/// Advisory exclusive lock guarding write access to a log directory.
///
/// The lock is held for as long as the file handle is open; dropping the
/// `WriteLock` releases it.
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
    file: Option<File>,
}

impl WriteLock {
    /// Creates an unlocked handle for the lock file in `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(LOCK_FILE),
            file: None,
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tries to take the lock without blocking. Returns whether it is held.
    ///
    /// Calling this while already holding the lock returns true.
    pub fn acquire(&mut self) -> bool {
        if self.file.is_some() {
            return true;
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot open lock file");
                return false;
            }
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %self.path.display(), "acquired write lock");
                self.file = Some(file);
                true
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "write lock is held elsewhere");
                false
            }
        }
    }

    /// Returns true while the lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Releases the lock. Releasing an unheld lock does nothing.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "failed to unlock write lock");
            }
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut lock = WriteLock::new(dir.path());
        assert!(!lock.is_locked());
        assert!(lock.acquire());
        assert!(lock.acquire());
        assert!(lock.is_locked());
        assert!(lock.path().exists());
    }

    #[test]
    fn second_holder_is_refused() {
        let dir = tempdir().unwrap();
        let mut first = WriteLock::new(dir.path());
        let mut second = WriteLock::new(dir.path());

        assert!(first.acquire());
        assert!(!second.acquire());
        assert!(!second.is_locked());

        first.release();
        assert!(second.acquire());
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut lock = WriteLock::new(dir.path());
        lock.release();
        assert!(lock.acquire());
        lock.release();
        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn unopenable_lock_file_is_failure() {
        let dir = tempdir().unwrap();
        let mut lock = WriteLock::new(&dir.path().join("missing"));
        assert!(!lock.acquire());
    }

    #[test]
    fn drop_releases() {
        let dir = tempdir().unwrap();
        {
            let mut lock = WriteLock::new(dir.path());
            assert!(lock.acquire());
        }
        let mut again = WriteLock::new(dir.path());
        assert!(again.acquire());
    }
}
