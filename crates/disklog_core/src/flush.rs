//! Background flushing of open segment writers.

use crate::segment::SegmentWriter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Name of the flush thread.
const THREAD_NAME: &str = "disklog-flush";

/// Segment writers that the scheduler flushes periodically.
///
/// Writers register when a segment is opened for write and unregister when
/// it is closed.
#[derive(Debug, Clone, Default)]
pub struct FlushRegistry {
    writers: Arc<Mutex<HashMap<String, Arc<SegmentWriter>>>>,
}

impl FlushRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a writer, replacing any writer registered under the same name.
    pub fn register(&self, writer: Arc<SegmentWriter>) {
        self.writers
            .lock()
            .insert(writer.name().to_string(), writer);
    }

    /// Removes the writer for `name`.
    pub fn unregister(&self, name: &str) {
        self.writers.lock().remove(name);
    }

    /// Number of registered writers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writers.lock().len()
    }

    /// Returns true if no writers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes every registered writer, logging failures.
    pub fn flush_all(&self) {
        // Snapshot so flushing does not hold the registry lock.
        let writers: Vec<Arc<SegmentWriter>> = self.writers.lock().values().cloned().collect();
        for writer in writers {
            if let Err(e) = writer.flush() {
                warn!(file = writer.name(), error = %e, "background flush failed");
            }
        }
    }
}

/// Periodic flush task.
#[derive(Debug)]
pub struct FlushScheduler {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Starts flushing `registry` every `interval` on a named thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn start(registry: FlushRegistry, interval: Duration) -> std::io::Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                debug!(?interval, "flush task started");
                while !flag.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    registry.flush_all();
                }
                debug!("flush task stopped");
            })?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Returns true while the task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels the task and waits up to `join_timeout` for it to exit.
    ///
    /// A task that does not exit in time is logged and left detached.
    pub fn stop(&mut self, join_timeout: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancel.store(true, Ordering::Release);
        handle.thread().unpark();

        let deadline = Instant::now() + join_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("flush task panicked");
            }
        } else {
            warn!(?join_timeout, "flush task did not stop in time");
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ChecksumKind, LogRecord};
    use crate::segment::{SegmentFile, SegmentOptions, HEADER_SIZE};
    use tempfile::tempdir;

    #[test]
    fn registry_tracks_open_writers() {
        let dir = tempdir().unwrap();
        let registry = FlushRegistry::new();
        let mut seg =
            SegmentFile::create(dir.path(), 1, Some(1), SegmentOptions::default(), Some(&registry))
                .unwrap();
        assert_eq!(registry.len(), 1);

        seg.close().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn scheduler_flushes_staged_writes() {
        let dir = tempdir().unwrap();
        let registry = FlushRegistry::new();
        let mut seg =
            SegmentFile::create(dir.path(), 1, Some(1), SegmentOptions::default(), Some(&registry))
                .unwrap();
        seg.write_record(&LogRecord::new(vec![1; 32], ChecksumKind::Crc32), u64::MAX)
            .unwrap();

        let on_disk = || std::fs::metadata(seg.path()).unwrap().len();
        assert_eq!(on_disk(), HEADER_SIZE);

        let mut scheduler =
            FlushScheduler::start(registry.clone(), Duration::from_millis(5)).unwrap();
        assert!(scheduler.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while on_disk() == HEADER_SIZE && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(on_disk() > HEADER_SIZE);

        scheduler.stop(Duration::from_secs(1));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut scheduler =
            FlushScheduler::start(FlushRegistry::new(), Duration::from_secs(60)).unwrap();
        scheduler.stop(Duration::from_secs(1));
        scheduler.stop(Duration::from_secs(1));
    }
}
