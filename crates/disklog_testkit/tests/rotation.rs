//! Segment rotation, index contiguity and retention.

use disklog_core::record::decode_event_header;
use disklog_core::segment::ReadOutcome;
use disklog_core::{RecordType, SegmentFile, SegmentOptions};
use disklog_testkit::prelude::*;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// `(seqno, fragno, last_frag)` of every event in a segment, and whether it
/// ends with a ROTATE record.
fn segment_events(path: &Path) -> (Vec<(u64, u16, bool)>, bool) {
    let dir = path.parent().unwrap();
    let name = path.file_name().unwrap().to_str().unwrap();
    let mut segment = SegmentFile::from_name(dir, name, SegmentOptions::default()).unwrap();
    segment.open_read().unwrap();
    let mut events = Vec::new();
    loop {
        match segment.read_record(Duration::ZERO).unwrap() {
            ReadOutcome::Record(record) => match record.record_type() {
                Some(RecordType::Event) => {
                    let (header, _) = decode_event_header(&record).unwrap();
                    events.push((header.seqno, header.fragno, header.last_frag));
                }
                Some(RecordType::Rotate) => return (events, true),
                None => panic!("unknown record type"),
            },
            ReadOutcome::Empty | ReadOutcome::Truncated => return (events, false),
        }
    }
}

#[test]
fn rotation_keeps_index_valid() {
    let log = TempLog::with_config(|c| c.max_segment_size(300));
    log.append_range(1..=40);

    let entries = log.index_entries();
    assert!(entries.len() > 5);
    log.validate().unwrap();
    for pair in entries.windows(2) {
        assert_eq!(pair[0].end_seqno + 1, pair[1].start_seqno);
    }

    let paths = segments(log.path());
    for (pos, path) in paths.iter().enumerate() {
        let (events, rotated) = segment_events(path);
        assert_eq!(rotated, pos + 1 < paths.len(), "{}", path.display());
        assert_eq!(events.first().unwrap().0, entries[pos].start_seqno);
    }
}

#[test]
fn transactions_never_span_segments() {
    let log = TempLog::with_config(|c| c.max_segment_size(256));
    for seqno in 1..=15 {
        log.append_events(fragments(seqno, 1 + (seqno % 4) as u16));
    }
    assert!(log.file_count() > 3);

    for path in segments(log.path()) {
        let (events, _) = segment_events(&path);
        assert_eq!(events.first().unwrap().1, 0, "segment starts mid-transaction");
        assert!(events.last().unwrap().2, "segment ends mid-transaction");
    }
}

#[test]
fn reader_follows_rotation_to_new_segment() {
    let log = TempLog::with_config(|c| c.max_segment_size(200));
    log.append_range(1..=2);

    let mut reader = log.connect(true).unwrap();
    assert!(reader.seek(1, 0).unwrap());
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, 1);
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, 2);

    log.append_range(3..=10);
    let rest: Vec<u64> = std::iter::from_fn(|| reader.next(false).unwrap())
        .map(|e| e.seqno)
        .collect();
    assert_eq!(rest, (3..=10).collect::<Vec<_>>());
}

#[test]
fn retention_purges_old_segments() {
    let log = TempLog::with_config(|c| {
        c.max_segment_size(300)
            .retention(Some(Duration::from_millis(20)))
    });
    log.append_range(1..=10);
    let before = log.file_count();
    thread::sleep(Duration::from_millis(60));

    log.append_range(11..=12);
    log.purge();
    assert!(log.file_count() < before + 1);
    assert!(log.min_seqno().unwrap() > 1);
    log.validate().unwrap();

    let min = log.min_seqno().unwrap();
    assert_eq!(log.read_all(min), (min..=12).collect::<Vec<_>>());
}

#[test]
fn active_seqno_blocks_purge() {
    let log = TempLog::with_config(|c| {
        c.max_segment_size(300)
            .retention(Some(Duration::from_millis(1)))
    });
    log.set_active_seqno(Some(1));
    log.append_range(1..=10);
    thread::sleep(Duration::from_millis(20));

    assert!(log.purge().is_empty());
    assert_eq!(log.min_seqno(), Some(1));

    log.set_active_seqno(None);
    assert!(!log.purge().is_empty());
    assert!(log.file_count() >= 2);
}
