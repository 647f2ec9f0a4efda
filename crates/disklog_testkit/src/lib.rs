//! # DiskLog Testkit
//!
//! Test utilities for DiskLog.
//!
//! This crate provides:
//! - Temporary log fixtures and event builders
//! - Crash simulation by cutting, truncating or corrupting segment files
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use disklog_testkit::prelude::*;
//!
//! #[test]
//! fn append_and_read() {
//!     let log = TempLog::new();
//!     log.append_range(1..=5);
//!     assert_eq!(log.read_all(1), (1..=5).collect::<Vec<_>>());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
