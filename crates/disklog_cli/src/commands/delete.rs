//! Delete command implementation.

use super::open_log;
use std::path::Path;
use tracing::{info, warn};

/// Runs the delete command.
pub fn run(
    path: &Path,
    low: Option<u64>,
    high: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Deleting {:?}..={:?} from {:?}", low, high, path);
    let log = open_log(path, true)?;
    if log.is_read_only() {
        warn!("Write lock held elsewhere for {:?}", path);
        return Err("Log is locked by another writer".into());
    }

    let before = (log.min_seqno(), log.max_seqno(), log.file_count());
    log.delete(low, high)?;

    println!(
        "Deleted [{}, {}]",
        low.map_or_else(|| "start".to_string(), |l| l.to_string()),
        high.map_or_else(|| "end".to_string(), |h| h.to_string()),
    );
    println!("  before: seqnos {:?} - {:?}, {} segments", before.0, before.1, before.2);
    println!(
        "  after:  seqnos {:?} - {:?}, {} segments",
        log.min_seqno(),
        log.max_seqno(),
        log.file_count()
    );
    log.release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use disklog_core::{DiskLog, LogConfig, ReplEvent};
    use tempfile::tempdir;

    #[test]
    fn deletes_tail_and_releases_lock() {
        let dir = tempdir().unwrap();
        let log = DiskLog::open(LogConfig::new(dir.path())).unwrap();
        let mut writer = log.connect(false).unwrap();
        for seqno in 1..=10 {
            writer.store(&ReplEvent::new(seqno, vec![1; 16]), true).unwrap();
        }
        writer.release().unwrap();

        // The lock is still held, so the command refuses.
        assert!(run(dir.path(), Some(6), None).is_err());
        log.release();

        run(dir.path(), Some(6), None).unwrap();
        let reopened = DiskLog::open(LogConfig::new(dir.path())).unwrap();
        assert!(!reopened.is_read_only());
        assert_eq!(reopened.max_seqno(), Some(5));
    }
}
