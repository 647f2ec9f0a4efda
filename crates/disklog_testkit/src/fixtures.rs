//! Test fixtures and log helpers.
//!
//! Provides a temporary log directory that can be opened, closed and
//! reopened, plus builders for common events.

use disklog_core::{DiskLog, LogConfig, LogConnection, LogResult, ReplEvent};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A log in a temporary directory, removed on drop.
pub struct TempLog {
    log: Option<Arc<DiskLog>>,
    config: LogConfig,
    _temp_dir: TempDir,
}

impl TempLog {
    /// Opens a log with test-friendly timeouts.
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Opens a log after adjusting the default test configuration.
    pub fn with_config(adjust: impl FnOnce(LogConfig) -> LogConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = adjust(test_config(temp_dir.path()));
        let log = DiskLog::open(config.clone()).expect("Failed to open log");
        Self {
            log: Some(log),
            config,
            _temp_dir: temp_dir,
        }
    }

    /// The open log.
    pub fn log(&self) -> &Arc<DiskLog> {
        self.log.as_ref().expect("Log is closed")
    }

    /// Opens a connection to the log.
    pub fn connect(&self, read_only: bool) -> LogResult<LogConnection> {
        self.log().connect(read_only)
    }

    /// Log directory.
    pub fn path(&self) -> &Path {
        &self.config.log_dir
    }

    /// Configuration used to open the log.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Releases the log, leaving its files in place.
    pub fn close(&mut self) {
        if let Some(log) = self.log.take() {
            log.release();
        }
    }

    /// Releases and reopens the log, running recovery.
    pub fn reopen(&mut self) -> &Arc<DiskLog> {
        self.close();
        self.log = Some(DiskLog::open(self.config.clone()).expect("Failed to reopen log"));
        self.log()
    }

    /// Stores one single-fragment event per seqno through a fresh writer.
    pub fn append_range(&self, seqnos: RangeInclusive<u64>) {
        self.append_events(seqnos.map(event));
    }

    /// Stores events through a fresh writer, committing after the last.
    pub fn append_events(&self, events: impl IntoIterator<Item = ReplEvent>) {
        let mut writer = self.log().connect(false).expect("Failed to connect writer");
        for event in events {
            writer.store(&event, false).expect("Failed to store event");
        }
        writer.commit().ok();
        writer.release().expect("Failed to release writer");
    }

    /// Seqnos of every event from `seqno` to the current end of the log.
    pub fn read_all(&self, seqno: u64) -> Vec<u64> {
        self.read_events(seqno).into_iter().map(|e| e.seqno).collect()
    }

    /// Reads every event from `seqno` to the current end of the log.
    pub fn read_events(&self, seqno: u64) -> Vec<ReplEvent> {
        let mut reader = self.log().connect(true).expect("Failed to connect reader");
        assert!(reader.seek(seqno, 0).expect("Seek failed"), "seqno {seqno} not in log");
        let mut events = Vec::new();
        while let Some(event) = reader.next(false).expect("Read failed") {
            events.push(event);
        }
        events
    }
}

impl Default for TempLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TempLog {
    type Target = DiskLog;

    fn deref(&self) -> &Self::Target {
        self.log()
    }
}

impl Drop for TempLog {
    fn drop(&mut self) {
        self.close();
    }
}

/// Default configuration for tests: short timeouts, small buffers.
pub fn test_config(dir: &Path) -> LogConfig {
    LogConfig::new(dir)
        .read_timeout(Duration::from_millis(200))
        .rotate_timeout(Duration::from_secs(2))
        .buffer_size(4096)
}

/// A single-fragment event with a small payload derived from its seqno.
pub fn event(seqno: u64) -> ReplEvent {
    ReplEvent::new(seqno, format!("payload for {seqno}").into_bytes())
        .with_ids("source-1", format!("binlog.000001:{seqno}"), "shard-0")
        .with_source_tstamp(1_700_000_000_000 + seqno)
}

/// The fragments of one transaction, the last one marked `last_frag`.
pub fn fragments(seqno: u64, count: u16) -> Vec<ReplEvent> {
    (0..count)
        .map(|fragno| {
            ReplEvent::new(seqno, vec![fragno as u8; 32])
                .with_fragment(fragno, fragno + 1 == count)
        })
        .collect()
}

/// A single-fragment event with a payload of `size` bytes.
pub fn sized_event(seqno: u64, size: usize) -> ReplEvent {
    ReplEvent::new(seqno, vec![(seqno % 251) as u8; size])
}
