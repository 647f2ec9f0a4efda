//! # DiskLog Core
//!
//! Segmented, append-only log of replication events.
//!
//! This crate provides:
//! - A framed, checksummed record format for events and rotation markers
//! - Segment files with a versioned header, rotated at a size bound
//! - A segment index mapping seqno ranges to files, with retention purge
//! - Crash recovery that repairs a damaged or half-written tail
//! - Read connections that seek and tail, one write connection that appends
//! - A cross-process write lock and an optional background flush task
//!
//! ## Durability Model
//!
//! Writes go to a buffered file handle. They reach the OS when the writer
//! commits, when `flush_interval` is zero, or on the next background flush;
//! `fsync_on_flush` additionally syncs them to disk. After a crash the tail
//! is truncated back to the last complete transaction.
//!
//! ## Example
//!
//! ```no_run
//! use disklog_core::{DiskLog, LogConfig, ReplEvent};
//!
//! let log = DiskLog::open(LogConfig::new("data/log"))?;
//! let mut writer = log.connect(false)?;
//! writer.store(&ReplEvent::new(1, b"hello".to_vec()), true)?;
//! assert_eq!(log.max_seqno(), Some(1));
//! # Ok::<(), disklog_core::LogError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod error;
mod event;
mod flush;
pub mod index;
mod lock;
mod log;
mod manager;
pub mod record;
mod recovery;
pub mod segment;
mod serializer;

pub use config::LogConfig;
pub use connection::{ConnectionState, LogConnection};
pub use error::{LogError, LogResult};
pub use event::{EventHeader, ReplEvent};
pub use flush::{FlushRegistry, FlushScheduler};
pub use index::{IndexEntry, SegmentIndex};
pub use lock::{WriteLock, LOCK_FILE};
pub use log::DiskLog;
pub use manager::{ConnectionManager, ConnectionShared};
pub use record::{ChecksumKind, LogRecord, RecordType};
pub use recovery::RecoverySummary;
pub use segment::{SegmentFile, SegmentHeader, SegmentOptions};
pub use serializer::{
    serializer_by_name, BinarySerializer, CborSerializer, EventSerializer, DEFAULT_SERIALIZER,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
