//! Validate command implementation.

use super::open_log;
use disklog_core::record::{decode_event_header, decode_rotate};
use disklog_core::segment::ReadOutcome;
use disklog_core::{DiskLog, RecordType, SegmentFile, SegmentOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Result of scanning one segment.
#[derive(Debug, Default)]
pub struct SegmentCheck {
    /// File name.
    pub file: String,
    /// Event records read.
    pub events: usize,
    /// Whether the segment ends with a ROTATE record.
    pub rotated: bool,
    /// First problem found, if any.
    pub error: Option<String>,
}

/// Runs the validate command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating log at {:?}", path);
    let log = open_log(path, false)?;
    println!("Validating log at {}", path.display());

    let mut failed = false;
    match log.validate() {
        Ok(()) => println!("  index: ok ({} segments)", log.file_count()),
        Err(e) => {
            println!("  index: FAILED - {e}");
            failed = true;
        }
    }

    for check in check_segments(&log)? {
        match &check.error {
            None => println!("  {}: ok ({} events)", check.file, check.events),
            Some(error) => {
                println!("  {}: FAILED after {} events - {error}", check.file, check.events);
                failed = true;
            }
        }
    }

    if failed {
        Err("Log validation failed".into())
    } else {
        println!("Log is valid");
        Ok(())
    }
}

/// Reads every record of every segment with checksum verification.
pub fn check_segments(log: &DiskLog) -> Result<Vec<SegmentCheck>, Box<dyn std::error::Error>> {
    let options = SegmentOptions {
        verify_checksums: true,
        ..SegmentOptions::from_config(log.config())
    };
    let entries = log.index_entries();
    let mut checks = Vec::with_capacity(entries.len());
    for (pos, entry) in entries.iter().enumerate() {
        let is_last = pos + 1 == entries.len();
        let mut check = SegmentCheck {
            file: entry.file_name.clone(),
            ..SegmentCheck::default()
        };
        let mut segment = SegmentFile::from_name(log.dir(), &entry.file_name, options)?;
        if let Err(e) = scan(&mut segment, &mut check) {
            check.error = Some(e.to_string());
        } else if !is_last && !check.rotated {
            check.error = Some("closed segment has no ROTATE record".to_string());
        }
        debug!(
            file = %check.file,
            events = check.events,
            ok = check.error.is_none(),
            "checked segment"
        );
        checks.push(check);
    }
    Ok(checks)
}

fn scan(segment: &mut SegmentFile, check: &mut SegmentCheck) -> disklog_core::LogResult<()> {
    segment.open_read()?;
    loop {
        match segment.read_record(Duration::ZERO)? {
            ReadOutcome::Record(record) => match record.record_type() {
                Some(RecordType::Event) => {
                    decode_event_header(&record)?;
                    check.events += 1;
                }
                Some(RecordType::Rotate) => {
                    decode_rotate(&record)?;
                    check.rotated = true;
                    return Ok(());
                }
                None => {
                    return Err(disklog_core::LogError::corrupt_record(
                        record.offset,
                        "unknown record type",
                    ))
                }
            },
            ReadOutcome::Empty => return Ok(()),
            ReadOutcome::Truncated => {
                return Err(disklog_core::LogError::corrupt_record(
                    segment.offset()?,
                    "partial record at end of segment",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disklog_core::{LogConfig, ReplEvent};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempdir;

    #[test]
    fn detects_flipped_byte() {
        let dir = tempdir().unwrap();
        let log = DiskLog::open(LogConfig::new(dir.path())).unwrap();
        let mut writer = log.connect(false).unwrap();
        for seqno in 1..=3 {
            writer.store(&ReplEvent::new(seqno, vec![7; 40]), true).unwrap();
        }

        let checks = check_segments(&log).unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].events, 3);
        assert!(checks[0].error.is_none());

        let mut file = OpenOptions::new()
            .write(true)
            .open(dir.path().join(log.last_file().unwrap()))
            .unwrap();
        file.seek(SeekFrom::Start(40)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let checks = check_segments(&log).unwrap();
        assert!(checks[0].error.is_some());
    }
}
