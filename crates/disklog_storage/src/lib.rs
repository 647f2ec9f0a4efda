//! # DiskLog Storage
//!
//! Storage backend trait and implementations for DiskLog.
//!
//! This crate provides the lowest-level storage abstraction for DiskLog.
//! Storage backends are **opaque byte stores** - they do not interpret
//! the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, flush, truncate)
//! - No knowledge of segment headers, records or events
//! - Must be `Send + Sync` so a writer can be flushed from a background thread
//! - DiskLog owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - Persistent storage using OS file APIs, opened either
//!   read-only (for tailing readers) or read-write (for the single writer)
//!
//! ## Example
//!
//! ```no_run
//! use disklog_storage::{FileBackend, StorageBackend};
//! use std::path::Path;
//!
//! let mut backend = FileBackend::create_new(Path::new("log.bin"), 4096).unwrap();
//! let offset = backend.append(b"hello world").unwrap();
//! backend.flush().unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::{Access, FileBackend};
