//! Crash simulation for DiskLog.
//!
//! A crash is simulated by editing segment files while the log is closed:
//! cutting them after a record, chopping bytes off the end, appending
//! garbage or flipping a byte. Reopening the log then exercises recovery.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use disklog_testkit::prelude::*;
//!
//! let mut log = TempLog::new();
//! log.append_range(1..=5);
//! log.close();
//! truncate_bytes(&last_segment(log.path()), 3);
//! assert_eq!(log.reopen().max_seqno(), Some(4));
//! ```

use disklog_core::segment::{list_segment_files, HEADER_SIZE};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Path of the newest segment in `dir`.
pub fn last_segment(dir: &Path) -> PathBuf {
    let files = list_segment_files(dir).expect("Failed to list segments");
    let name = files.last().expect("Log has no segments");
    dir.join(name)
}

/// Paths of all segments in `dir`, oldest first.
pub fn segments(dir: &Path) -> Vec<PathBuf> {
    list_segment_files(dir)
        .expect("Failed to list segments")
        .into_iter()
        .map(|name| dir.join(name))
        .collect()
}

/// Start offset and length of every complete record in a segment.
pub fn record_spans(path: &Path) -> Vec<(u64, u64)> {
    let bytes = fs::read(path).expect("Failed to read segment");
    let mut spans = Vec::new();
    let mut offset = HEADER_SIZE as usize;
    while offset + 4 <= bytes.len() {
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        if len < 4 || offset + len > bytes.len() {
            break;
        }
        spans.push((offset as u64, len as u64));
        offset += len;
    }
    spans
}

/// Truncates a segment right after its first `records` records.
pub fn cut_after_records(path: &Path, records: usize) {
    let end = record_spans(path)
        .iter()
        .take(records)
        .last()
        .map_or(HEADER_SIZE, |(offset, len)| offset + len);
    set_len(path, end);
}

/// Truncates a segment part-way through record number `record` (zero
/// based), keeping `keep` bytes of it.
pub fn cut_inside_record(path: &Path, record: usize, keep: u64) {
    let (offset, len) = record_spans(path)[record];
    assert!(keep < len, "cut must fall inside the record");
    set_len(path, offset + keep);
}

/// Removes the last `bytes` bytes of a file.
pub fn truncate_bytes(path: &Path, bytes: u64) {
    let len = fs::metadata(path).expect("Failed to stat segment").len();
    set_len(path, len.saturating_sub(bytes));
}

/// Appends raw bytes to a file, as a torn write would leave them.
pub fn append_garbage(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .expect("Failed to open segment");
    file.write_all(bytes).expect("Failed to append");
}

/// Inverts every bit of the byte at `offset`.
pub fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("Failed to open segment");
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).expect("Seek failed");
    file.read_exact(&mut byte).expect("Read failed");
    byte[0] = !byte[0];
    file.seek(SeekFrom::Start(offset)).expect("Seek failed");
    file.write_all(&byte).expect("Write failed");
}

fn set_len(path: &Path, len: u64) {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_len(len))
        .expect("Failed to truncate segment");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TempLog;

    #[test]
    fn spans_cover_the_segment() {
        let mut log = TempLog::new();
        log.append_range(1..=4);
        log.close();

        let path = last_segment(log.path());
        let spans = record_spans(&path);
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0].0, HEADER_SIZE);
        let (offset, len) = spans[3];
        assert_eq!(offset + len, fs::metadata(&path).unwrap().len());

        cut_after_records(&path, 2);
        assert_eq!(record_spans(&path).len(), 2);
    }
}
