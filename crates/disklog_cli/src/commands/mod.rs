//! CLI command implementations.

pub mod delete;
pub mod dump;
pub mod index;
pub mod validate;

use disklog_core::{DiskLog, LogConfig};
use std::path::Path;
use std::sync::Arc;

/// Opens the log at `path`, read-only unless `writable`.
pub fn open_log(path: &Path, writable: bool) -> Result<Arc<DiskLog>, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No log found at {}", path.display()).into());
    }
    let config = LogConfig::new(path).read_only(!writable);
    Ok(DiskLog::open(config)?)
}
