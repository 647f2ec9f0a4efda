//! Startup repair of the newest segment.
//!
//! Only the tail of the log can be damaged by a crash: earlier segments are
//! closed by a ROTATE record before their successor is created. Recovery
//! scans the newest segment and, when the log is writable:
//!
//! - truncates a partial record or unfinished transaction at the tail
//! - recreates a successor named by a trailing ROTATE record
//! - removes an empty tail segment left behind by an interrupted rotation
//!
//! A read-only log is never modified; damage is reported as a warning
//! because a live writer may still be completing it.

use crate::error::{LogError, LogResult};
use crate::index::SegmentIndex;
use crate::record::{decode_event_header, decode_rotate, RecordType};
use crate::segment::{ReadOutcome, SegmentFile, SegmentOptions, HEADER_SIZE};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why the end of a segment cannot be kept as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TailDamage {
    /// The last record is incomplete.
    PartialRecord,
    /// Fragments were written without the closing fragment.
    OpenTransaction,
    /// A record failed its length or checksum checks.
    Corrupt(String),
}

impl fmt::Display for TailDamage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartialRecord => write!(f, "partial record"),
            Self::OpenTransaction => write!(f, "unfinished transaction"),
            Self::Corrupt(reason) => write!(f, "corrupt record ({reason})"),
        }
    }
}

/// What a sequential scan found in one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentScan {
    /// Offset just past the last complete transaction or ROTATE record.
    pub(crate) complete_offset: u64,
    /// `seqno_end` of the last complete transaction.
    pub(crate) last_seqno: Option<u64>,
    /// Next index named by a trailing ROTATE record.
    pub(crate) rotate_to: Option<u32>,
    /// File length when scanned.
    pub(crate) length: u64,
    /// Complete records read.
    pub(crate) records: usize,
    /// Damage found at the end of the segment.
    pub(crate) damage: Option<TailDamage>,
}

impl SegmentScan {
    /// Returns true if the segment holds nothing past its header.
    pub(crate) fn is_empty(&self) -> bool {
        self.records == 0 && self.length <= HEADER_SIZE
    }
}

/// Scans a segment from its first record to its end or first ROTATE.
pub(crate) fn scan_segment(
    dir: &Path,
    name: &str,
    options: SegmentOptions,
) -> LogResult<SegmentScan> {
    let mut segment = SegmentFile::from_name(dir, name, options)?;
    let mut scan = SegmentScan {
        complete_offset: HEADER_SIZE,
        last_seqno: None,
        rotate_to: None,
        length: segment.length()?,
        records: 0,
        damage: None,
    };
    // A crash while creating a segment can leave it without a full header.
    if scan.length < HEADER_SIZE {
        return Ok(scan);
    }
    segment.open_read()?;
    let mut open_transaction = false;

    loop {
        let record = match segment.read_record(Duration::ZERO) {
            Ok(ReadOutcome::Record(record)) => record,
            Ok(ReadOutcome::Empty) => break,
            Ok(ReadOutcome::Truncated) => {
                scan.damage = Some(TailDamage::PartialRecord);
                break;
            }
            Err(e) if e.is_corruption() => {
                scan.damage = Some(TailDamage::Corrupt(e.to_string()));
                break;
            }
            Err(e) => return Err(e),
        };
        let end = record.offset + record.encoded_len() as u64;

        match record.record_type() {
            Some(RecordType::Event) => match decode_event_header(&record) {
                Ok((header, _)) => {
                    scan.records += 1;
                    if header.last_frag {
                        scan.last_seqno = Some(header.seqno_end);
                        scan.complete_offset = end;
                        open_transaction = false;
                    } else {
                        open_transaction = true;
                    }
                }
                Err(e) => {
                    scan.damage = Some(TailDamage::Corrupt(e.to_string()));
                    break;
                }
            },
            Some(RecordType::Rotate) => {
                scan.records += 1;
                scan.rotate_to = Some(decode_rotate(&record)?);
                scan.complete_offset = end;
                open_transaction = false;
                break;
            }
            None => {
                scan.damage = Some(TailDamage::Corrupt(format!(
                    "unknown record type at offset {}",
                    record.offset
                )));
                break;
            }
        }
    }

    if scan.damage.is_none() && open_transaction {
        scan.damage = Some(TailDamage::OpenTransaction);
    }
    debug!(
        file = name,
        records = scan.records,
        last_seqno = ?scan.last_seqno,
        damage = ?scan.damage,
        "scanned segment"
    );
    Ok(scan)
}

/// Outcome of recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Highest complete seqno in the log.
    pub max_seqno: Option<u64>,
    /// Bytes cut from the tail.
    pub truncated_bytes: u64,
    /// Empty tail segments deleted.
    pub removed_files: Vec<String>,
    /// Successor segment recreated after a trailing ROTATE.
    pub created_file: Option<String>,
}

/// Repairs the newest segment and records the highest seqno in `index`.
///
/// # Errors
///
/// Returns `LogConsistency` if the tail is still empty after one repair, or
/// any storage error met while scanning or repairing.
pub(crate) fn recover(
    index: &mut SegmentIndex,
    options: SegmentOptions,
    read_only: bool,
) -> LogResult<RecoverySummary> {
    let dir = index.dir().to_path_buf();
    let mut summary = RecoverySummary::default();
    let mut removed_empty_tail = false;

    loop {
        let Some(last) = index.last_file().cloned() else {
            return Err(LogError::consistency("log has no segments to recover"));
        };
        let scan = scan_segment(&dir, &last.file_name, options)?;

        if scan.is_empty() && index.len() > 1 {
            if read_only {
                warn!(file = %last.file_name, "tail segment is empty; using previous segment");
                summary.max_seqno = last_complete_seqno(index, &dir, options, 1)?;
                break;
            }
            if removed_empty_tail {
                return Err(LogError::consistency(format!(
                    "tail segment {} is empty after repair",
                    last.file_name
                )));
            }
            fs::remove_file(dir.join(&last.file_name))?;
            index.remove_file(&last.file_name);
            warn!(file = %last.file_name, "removed empty tail segment");
            summary.removed_files.push(last.file_name);
            removed_empty_tail = true;
            continue;
        }

        if let Some(damage) = &scan.damage {
            let discarded = scan.length.saturating_sub(scan.complete_offset);
            if read_only {
                warn!(
                    file = %last.file_name,
                    %damage,
                    bytes = discarded,
                    "damaged tail left in place (read-only)"
                );
            } else {
                let mut segment = SegmentFile::from_name(&dir, &last.file_name, options)?;
                segment.open_write(None)?;
                segment.set_length(scan.complete_offset)?;
                segment.close()?;
                summary.truncated_bytes += discarded;
                warn!(file = %last.file_name, %damage, bytes = discarded, "truncated damaged tail");
            }
        }

        summary.max_seqno = match scan.last_seqno {
            Some(seqno) => Some(seqno),
            None => last_complete_seqno(index, &dir, options, 1)?,
        };

        if let Some(next_index) = scan.rotate_to {
            if read_only {
                debug!(file = %last.file_name, "rotation successor not yet created");
            } else {
                let base = summary.max_seqno.map_or(last.start_seqno, |s| s + 1);
                let mut successor =
                    SegmentFile::create(&dir, next_index, Some(base), options, None)?;
                successor.close()?;
                index.add_new_file(base, successor.name())?;
                info!(file = successor.name(), base, "recreated missing rotation successor");
                summary.created_file = Some(successor.name().to_string());
            }
        }
        break;
    }

    if let Some(max) = summary.max_seqno {
        index.set_max_indexed_seqno(max);
    }
    info!(
        max_seqno = ?summary.max_seqno,
        truncated = summary.truncated_bytes,
        removed = summary.removed_files.len(),
        "recovery complete"
    );
    Ok(summary)
}

/// Highest complete seqno in the segments before the newest `skip`.
fn last_complete_seqno(
    index: &SegmentIndex,
    dir: &Path,
    options: SegmentOptions,
    skip: usize,
) -> LogResult<Option<u64>> {
    let names: Vec<String> = index
        .entries()
        .iter()
        .rev()
        .skip(skip)
        .map(|e| e.file_name.clone())
        .collect();
    for name in names {
        if let Some(seqno) = scan_segment(dir, &name, options)?.last_seqno {
            return Ok(Some(seqno));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ReplEvent;
    use crate::record::{encode_event, encode_rotate, ChecksumKind};
    use crate::segment::segment_file_name;
    use crate::serializer::BinarySerializer;
    use tempfile::tempdir;

    fn write(seg: &mut SegmentFile, event: ReplEvent) {
        let record = encode_event(&event, &BinarySerializer, ChecksumKind::Crc32).unwrap();
        seg.write_record(&record, u64::MAX).unwrap();
    }

    fn build(dir: &Path) -> SegmentIndex {
        SegmentIndex::build(dir, SegmentOptions::default(), None).unwrap()
    }

    #[test]
    fn clean_log_is_untouched() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut seg = SegmentFile::create(dir.path(), 1, None, opts, None).unwrap();
        for seqno in 1..=3 {
            write(&mut seg, ReplEvent::new(seqno, vec![0; 8]));
        }
        seg.close().unwrap();
        let before = seg.length().unwrap();

        let mut index = build(dir.path());
        let summary = recover(&mut index, opts, false).unwrap();
        assert_eq!(summary.max_seqno, Some(3));
        assert_eq!(summary.truncated_bytes, 0);
        assert_eq!(seg.length().unwrap(), before);
        assert_eq!(index.max_seqno(), Some(3));
    }

    #[test]
    fn open_transaction_is_truncated() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut seg = SegmentFile::create(dir.path(), 1, None, opts, None).unwrap();
        write(&mut seg, ReplEvent::new(1, vec![1]));
        seg.flush().unwrap();
        let complete = seg.length().unwrap();
        write(&mut seg, ReplEvent::new(2, vec![2]).with_fragment(0, false));
        seg.close().unwrap();

        let mut index = build(dir.path());
        let summary = recover(&mut index, opts, false).unwrap();
        assert_eq!(summary.max_seqno, Some(1));
        assert!(summary.truncated_bytes > 0);
        assert_eq!(seg.length().unwrap(), complete);
    }

    #[test]
    fn read_only_leaves_damage() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut seg = SegmentFile::create(dir.path(), 1, None, opts, None).unwrap();
        write(&mut seg, ReplEvent::new(1, vec![1]));
        write(&mut seg, ReplEvent::new(2, vec![2]).with_fragment(0, false));
        seg.close().unwrap();
        let before = seg.length().unwrap();

        let mut index = build(dir.path());
        let summary = recover(&mut index, opts, true).unwrap();
        assert_eq!(summary.max_seqno, Some(1));
        assert_eq!(summary.truncated_bytes, 0);
        assert_eq!(seg.length().unwrap(), before);
    }

    #[test]
    fn missing_successor_is_recreated() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut seg = SegmentFile::create(dir.path(), 1, None, opts, None).unwrap();
        write(&mut seg, ReplEvent::new(1, vec![1]));
        write(&mut seg, ReplEvent::new(2, vec![2]));
        seg.write_record(&encode_rotate(2, ChecksumKind::Crc32), u64::MAX)
            .unwrap();
        seg.close().unwrap();

        let mut index = build(dir.path());
        let summary = recover(&mut index, opts, false).unwrap();
        assert_eq!(summary.created_file.as_deref(), Some("log.data.0000000002"));
        assert_eq!(index.len(), 2);
        assert_eq!(index.last_file().unwrap().start_seqno, 3);
        index.validate().unwrap();

        let mut read_only = build(dir.path());
        recover(&mut read_only, opts, true).unwrap();
        assert_eq!(read_only.max_seqno(), Some(2));
    }

    #[test]
    fn empty_tail_is_removed_and_successor_recreated() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut first = SegmentFile::create(dir.path(), 1, None, opts, None).unwrap();
        write(&mut first, ReplEvent::new(1, vec![1]));
        first
            .write_record(&encode_rotate(2, ChecksumKind::Crc32), u64::MAX)
            .unwrap();
        first.close().unwrap();
        // Successor with only part of its header, as after a crash mid-create.
        fs::write(dir.path().join(segment_file_name(2)), &[0u8; 0]).unwrap();

        let mut index = SegmentIndex::new(dir.path(), None);
        index.add_new_file(1, &segment_file_name(1)).unwrap();
        index.add_new_file(2, &segment_file_name(2)).unwrap();

        let summary = recover(&mut index, opts, false).unwrap();
        assert_eq!(summary.removed_files, vec![segment_file_name(2)]);
        assert_eq!(summary.created_file, Some(segment_file_name(2)));
        assert_eq!(summary.max_seqno, Some(1));
        index.validate().unwrap();
    }

    #[test]
    fn second_empty_tail_is_inconsistent() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut first = SegmentFile::create(dir.path(), 1, None, opts, None).unwrap();
        write(&mut first, ReplEvent::new(1, vec![1]));
        first
            .write_record(&encode_rotate(2, ChecksumKind::Crc32), u64::MAX)
            .unwrap();
        first.close().unwrap();
        for file_index in [2, 3] {
            SegmentFile::create(dir.path(), file_index, Some(2), opts, None)
                .unwrap()
                .close()
                .unwrap();
        }

        let mut index = SegmentIndex::new(dir.path(), None);
        for file_index in 1..=3 {
            index
                .add_new_file(file_index.into(), &segment_file_name(file_index))
                .unwrap();
        }

        let err = recover(&mut index, opts, false).unwrap_err();
        assert!(matches!(err, LogError::LogConsistency { .. }), "{err}");
        // Only the first empty tail was removed.
        assert!(!dir.path().join(segment_file_name(3)).exists());
        assert!(dir.path().join(segment_file_name(2)).exists());
    }

    #[test]
    fn read_only_empty_tail_uses_previous_segment() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut first = SegmentFile::create(dir.path(), 1, None, opts, None).unwrap();
        write(&mut first, ReplEvent::filtered(1, 9));
        first
            .write_record(&encode_rotate(2, ChecksumKind::Crc32), u64::MAX)
            .unwrap();
        first.close().unwrap();
        SegmentFile::create(dir.path(), 2, Some(10), opts, None)
            .unwrap()
            .close()
            .unwrap();

        let mut index = build(dir.path());
        let summary = recover(&mut index, opts, true).unwrap();
        assert_eq!(summary.max_seqno, Some(9));
        assert!(summary.removed_files.is_empty());
        assert_eq!(index.len(), 2);
    }
}
