//! Bookkeeping for live connections.

use crate::error::{LogError, LogResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// State shared between a connection and the manager.
#[derive(Debug)]
pub struct ConnectionShared {
    id: u64,
    read_only: bool,
    released: AtomicBool,
    last_active: Mutex<Instant>,
}

impl ConnectionShared {
    fn new(id: u64, read_only: bool) -> Self {
        Self {
            id,
            read_only,
            released: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true for read connections.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns true once the connection has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Marks the connection released. Returns false if it already was.
    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Records activity now.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    writer: Option<u64>,
    connections: HashMap<u64, Arc<ConnectionShared>>,
}

/// Tracks connections: any number of readers, at most one writer.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection.
    ///
    /// # Errors
    ///
    /// Returns `WriterAlreadyExists` if a write connection is requested
    /// while another is live.
    pub fn register(&self, read_only: bool) -> LogResult<Arc<ConnectionShared>> {
        let mut inner = self.inner.lock();
        if !read_only && inner.writer.is_some() {
            return Err(LogError::WriterAlreadyExists);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let shared = Arc::new(ConnectionShared::new(id, read_only));
        inner.connections.insert(id, Arc::clone(&shared));
        if !read_only {
            inner.writer = Some(id);
        }
        debug!(id, read_only, "connection registered");
        Ok(shared)
    }

    /// Forgets connection `id` and marks it released. Returns false if it
    /// was not registered.
    pub fn release(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(shared) = inner.connections.remove(&id) else {
            return false;
        };
        shared.mark_released();
        if inner.writer == Some(id) {
            inner.writer = None;
        }
        debug!(id, "connection released");
        true
    }

    /// Releases every live connection and returns how many there were.
    pub fn release_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.connections.len();
        for (_, shared) in inner.connections.drain() {
            shared.mark_released();
        }
        inner.writer = None;
        count
    }

    /// Releases read connections idle for longer than `timeout` and returns
    /// their ids.
    pub fn release_idle(&self, timeout: Duration) -> Vec<u64> {
        let mut inner = self.inner.lock();
        let idle: Vec<u64> = inner
            .connections
            .values()
            .filter(|c| c.is_read_only() && c.idle_for() > timeout)
            .map(|c| c.id())
            .collect();
        for id in &idle {
            if let Some(shared) = inner.connections.remove(id) {
                shared.mark_released();
            }
        }
        if !idle.is_empty() {
            info!(count = idle.len(), "released idle read connections");
        }
        idle
    }

    /// Returns true while a write connection is live.
    #[must_use]
    pub fn has_writer(&self) -> bool {
        self.inner.lock().writer.is_some()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Returns true if no connections are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
