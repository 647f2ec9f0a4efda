//! Read and write connections to a [`DiskLog`].

use crate::error::{LogError, LogResult};
use crate::event::{EventHeader, ReplEvent};
use crate::log::DiskLog;
use crate::manager::ConnectionShared;
use crate::record::{
    decode_event, decode_event_header, decode_rotate, encode_event, LogRecord, RecordType,
};
use crate::segment::{poll_until, ReadOutcome, SegmentFile, HEADER_SIZE};
use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Position of the last event stored, used to enforce write ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WritePosition {
    seqno: u64,
    seqno_end: u64,
    fragno: u16,
    last_frag: bool,
}

impl WritePosition {
    /// Position after a complete transaction ending at `seqno`.
    pub(crate) fn complete(seqno: u64) -> Self {
        Self {
            seqno,
            seqno_end: seqno,
            fragno: 0,
            last_frag: true,
        }
    }

    pub(crate) fn of(event: &ReplEvent) -> Self {
        Self {
            seqno: event.seqno,
            seqno_end: event.seqno_end(),
            fragno: event.fragno,
            last_frag: event.last_frag,
        }
    }

    /// Checks that `event` may follow this position.
    ///
    /// A later fragment of an open transaction or any seqno above the last
    /// one covered is accepted.
    pub(crate) fn admits(&self, event: &ReplEvent) -> Result<(), String> {
        if event.seqno == self.seqno {
            if self.last_frag {
                return Err(format!("seqno {} is already complete", event.seqno));
            }
            if event.fragno <= self.fragno {
                return Err(format!(
                    "fragment {} of seqno {} does not follow fragment {}",
                    event.fragno, event.seqno, self.fragno
                ));
            }
            return Ok(());
        }
        if event.seqno > self.seqno_end {
            return Ok(());
        }
        Err(format!(
            "seqno {} does not follow seqno {}",
            event.seqno, self.seqno_end
        ))
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opened but not yet positioned by `seek`.
    Unpositioned,
    /// Positioned by a successful `seek`.
    Positioned,
    /// Has returned or stored at least one event.
    Consuming,
    /// Released; every further operation fails.
    Released,
}

/// A connection reading from or appending to the log.
///
/// Read connections [`seek`](Self::seek) to a position and then call
/// [`next`](Self::next). Write connections [`store`](Self::store) events at
/// the end of the log; at most one is live at a time.
pub struct LogConnection {
    log: Arc<DiskLog>,
    shared: Arc<ConnectionShared>,
    state: ConnectionState,
    file: Option<SegmentFile>,
    /// Events found by `seek` and not yet returned.
    pending: VecDeque<ReplEvent>,
    /// Seek target; events that end below it are skipped.
    min_seqno: u64,
    /// Set when the last write crossed the segment size bound.
    rotate_due: bool,
    /// Set after an out-of-order store.
    poisoned: bool,
}

impl std::fmt::Debug for LogConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogConnection")
            .field("id", &self.shared.id())
            .field("read_only", &self.shared.is_read_only())
            .field("state", &self.state())
            .field("file", &self.file.as_ref().map(SegmentFile::name))
            .finish_non_exhaustive()
    }
}

impl LogConnection {
    pub(crate) fn new(log: Arc<DiskLog>, shared: Arc<ConnectionShared>) -> Self {
        Self {
            log,
            shared,
            state: ConnectionState::Unpositioned,
            file: None,
            pending: VecDeque::new(),
            min_seqno: 0,
            rotate_due: false,
            poisoned: false,
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    /// Returns true for read connections.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.shared.is_read_only()
    }

    /// Current state. Reports `Released` once the connection or its log has
    /// been released.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.shared.is_released() || self.log.is_released() {
            ConnectionState::Released
        } else {
            self.state
        }
    }

    /// Positions the connection at `(seqno, fragno)`.
    ///
    /// Returns true when positioned: either at the matching event, at a
    /// filtered event covering `seqno`, or at the end of the log. Returns
    /// false if `seqno` is below the start of the log or falls in a gap.
    ///
    /// When the log ends with a filtered event covering `seqno`, that event
    /// is returned next even though a later event for `seqno` could still be
    /// written.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyReleased`, a corruption or storage error, or
    /// `Timeout` while following a rotation whose successor never appears.
    pub fn seek(&mut self, seqno: u64, fragno: u16) -> LogResult<bool> {
        self.ensure_live()?;
        self.shared.touch();
        self.pending.clear();
        self.close_file()?;
        self.state = ConnectionState::Unpositioned;

        let entry = self.log.index().lock().get_file(seqno).cloned();
        let Some(entry) = entry else {
            debug!(id = self.id(), seqno, "seek below the start of the log");
            return Ok(false);
        };
        let mut file =
            SegmentFile::from_name(self.log.dir(), &entry.file_name, self.log.options())?;
        file.open_read()?;
        self.file = Some(file);

        let mut previous: Option<(EventHeader, LogRecord)> = None;
        let found = loop {
            match self.open_file()?.read_record(Duration::ZERO)? {
                ReadOutcome::Record(record) => match record.record_type() {
                    Some(RecordType::Event) => {
                        let (header, _) = decode_event_header(&record)?;
                        if header.seqno == seqno && header.fragno == fragno {
                            break vec![record];
                        }
                        if (header.seqno, header.fragno) > (seqno, fragno) {
                            match previous {
                                Some((prev, gap)) if prev.is_filtered() && prev.covers(seqno) => {
                                    // The crossing record is already consumed.
                                    break vec![gap, record];
                                }
                                _ => {
                                    debug!(id = self.id(), seqno, fragno, "seek target not in log");
                                    self.close_file()?;
                                    return Ok(false);
                                }
                            }
                        }
                        previous = Some((header, record));
                    }
                    Some(RecordType::Rotate) => {
                        let next = decode_rotate(&record)?;
                        self.follow_rotate(next)?;
                    }
                    None => return Err(unknown_record(&record)),
                },
                ReadOutcome::Empty | ReadOutcome::Truncated => {
                    break previous
                        .filter(|(prev, _)| prev.is_filtered() && prev.covers(seqno))
                        .map(|(_, record)| vec![record])
                        .unwrap_or_default();
                }
            }
        };

        for record in &found {
            let event = decode_event(record, self.log.serializer())?;
            self.pending.push_back(event);
        }
        self.min_seqno = seqno;
        self.state = ConnectionState::Positioned;
        debug!(
            id = self.id(),
            seqno,
            fragno,
            queued = self.pending.len(),
            "connection positioned"
        );
        Ok(true)
    }

    /// Returns the next event.
    ///
    /// At the end of the log a blocking call waits up to the configured read
    /// timeout; a non-blocking call returns `None`.
    ///
    /// # Errors
    ///
    /// Returns `NotPositioned` before a successful `seek`, `Timeout` when a
    /// blocking read or rotation follow runs out of time, `AlreadyReleased`
    /// when the connection or log is released during the wait, or a
    /// corruption or storage error.
    pub fn next(&mut self, block: bool) -> LogResult<Option<ReplEvent>> {
        self.ensure_live()?;
        if self.state == ConnectionState::Unpositioned
            || !self.file.as_ref().is_some_and(SegmentFile::is_open_for_read)
        {
            return Err(LogError::NotPositioned);
        }
        self.shared.touch();

        if let Some(event) = self.pending.pop_front() {
            self.state = ConnectionState::Consuming;
            return Ok(Some(event));
        }

        let wait = if block {
            self.log.config().read_timeout
        } else {
            Duration::ZERO
        };
        let released = self.release_check();
        loop {
            match self.open_file()?.read_record_unless(wait, &released)? {
                ReadOutcome::Record(record) => match record.record_type() {
                    Some(RecordType::Event) => {
                        let (header, _) = decode_event_header(&record)?;
                        if header.seqno_end < self.min_seqno {
                            continue;
                        }
                        let event = decode_event(&record, self.log.serializer())?;
                        self.state = ConnectionState::Consuming;
                        return Ok(Some(event));
                    }
                    Some(RecordType::Rotate) => {
                        let next = decode_rotate(&record)?;
                        self.follow_rotate(next)?;
                    }
                    None => return Err(unknown_record(&record)),
                },
                ReadOutcome::Empty | ReadOutcome::Truncated => return Ok(None),
            }
        }
    }

    /// Appends `event` at the end of the log.
    ///
    /// Events must be stored in order: a higher seqno than any stored so
    /// far, or the next fragment of the open transaction. An out-of-order
    /// event writes nothing and leaves the connection unusable for further
    /// stores.
    ///
    /// # Errors
    ///
    /// Returns `NotWritable` on a read connection, `SequenceOrder` for an
    /// out-of-order event, or a serialization or storage error.
    pub fn store(&mut self, event: &ReplEvent, commit: bool) -> LogResult<()> {
        self.ensure_live()?;
        if self.shared.is_read_only() {
            return Err(LogError::not_writable("connection is read-only"));
        }
        if self.poisoned {
            return Err(LogError::sequence_order(
                "connection rejected an out-of-order event and must be released",
            ));
        }
        self.shared.touch();

        let log = Arc::clone(&self.log);
        let position = *log.write_position().lock();
        if let Some(position) = position {
            if let Err(message) = position.admits(event) {
                self.poisoned = true;
                warn!(id = self.id(), %event, %message, "rejected out-of-order event");
                return Err(LogError::sequence_order(message));
            }
        }

        let config = log.config();
        let record = encode_event(event, log.serializer(), config.checksum_kind())?;

        if !self.file.as_ref().is_some_and(SegmentFile::is_open_for_write) {
            self.close_file()?;
            let tail = log.open_tail_for_write()?;
            self.rotate_due = tail.length()? > config.max_segment_size;
            self.file = Some(tail);
        }
        if self.rotate_due && event.fragno == 0 {
            let current = self.open_file()?;
            let next = log.rotate(current, event.seqno)?;
            self.file = Some(next);
            self.rotate_due = false;
        }

        let file = self.open_file()?;
        let crossed = file.write_record(&record, config.max_segment_size)?;
        if commit || !config.async_flush() {
            file.flush()?;
        }
        self.rotate_due = crossed;

        *log.write_position().lock() = Some(WritePosition::of(event));
        {
            let mut index = log.index().lock();
            index.set_first_seqno(event.seqno);
            if event.last_frag {
                index.set_max_indexed_seqno(event.seqno_end());
            }
        }
        self.state = ConnectionState::Consuming;
        Ok(())
    }

    /// Flushes stored events.
    ///
    /// # Errors
    ///
    /// Returns `NotPositioned` before any seek or store, or a storage error.
    pub fn commit(&mut self) -> LogResult<()> {
        self.ensure_live()?;
        if self.state == ConnectionState::Unpositioned {
            return Err(LogError::NotPositioned);
        }
        match &self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Does nothing; stored events are not transactional.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyReleased` or `NotPositioned`.
    pub fn rollback(&mut self) -> LogResult<()> {
        self.ensure_live()?;
        if self.state == ConnectionState::Unpositioned {
            return Err(LogError::NotPositioned);
        }
        Ok(())
    }

    /// Closes the open segment and deregisters the connection.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyReleased` if the connection was already released,
    /// directly or by its log; the file is closed either way.
    pub fn release(&mut self) -> LogResult<()> {
        let already = self.state() == ConnectionState::Released;
        self.release_inner();
        if already {
            Err(LogError::AlreadyReleased)
        } else {
            Ok(())
        }
    }

    fn release_inner(&mut self) {
        self.pending.clear();
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.close() {
                warn!(id = self.id(), file = file.name(), error = %e, "failed to close segment");
            }
        }
        self.log.manager().release(self.shared.id());
        self.shared.mark_released();
        self.state = ConnectionState::Released;
    }

    /// Switches to segment `next_index`, waiting for it to appear.
    fn follow_rotate(&mut self, next_index: u32) -> LogResult<()> {
        self.close_file()?;
        let mut next = SegmentFile::new(self.log.dir(), next_index, self.log.options());
        let path = next.path().to_path_buf();
        let released = self.release_check();
        poll_until(
            self.log.config().rotate_timeout,
            || format!("rotation successor {}", path.display()),
            || {
                if released() {
                    return Err(LogError::AlreadyReleased);
                }
                Ok(fs::metadata(&path)
                    .ok()
                    .filter(|m| m.len() >= HEADER_SIZE)
                    .map(|_| ()))
            },
        )?;
        next.open_read()?;
        debug!(id = self.id(), file = next.name(), "followed rotation");
        self.file = Some(next);
        Ok(())
    }

    fn open_file(&mut self) -> LogResult<&mut SegmentFile> {
        self.file.as_mut().ok_or(LogError::NotPositioned)
    }

    fn close_file(&mut self) -> LogResult<()> {
        match self.file.take() {
            Some(mut file) => file.close(),
            None => Ok(()),
        }
    }

    /// Reports whether this connection or its log has been released, for
    /// use inside waits.
    fn release_check(&self) -> impl Fn() -> bool {
        let shared = Arc::clone(&self.shared);
        let log = Arc::clone(&self.log);
        move || shared.is_released() || log.is_released()
    }

    fn ensure_live(&self) -> LogResult<()> {
        if self.state() == ConnectionState::Released {
            Err(LogError::AlreadyReleased)
        } else {
            Ok(())
        }
    }
}

fn unknown_record(record: &LogRecord) -> LogError {
    LogError::corrupt_record(record.offset, "unknown record type")
}

impl Drop for LogConnection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Released {
            self.release_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use std::thread;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Arc<DiskLog> {
        DiskLog::open(
            LogConfig::new(dir)
                .read_timeout(Duration::from_millis(100))
                .rotate_timeout(Duration::from_millis(200)),
        )
        .unwrap()
    }

    fn event(seqno: u64) -> ReplEvent {
        ReplEvent::new(seqno, format!("event {seqno}").into_bytes())
    }

    #[test]
    fn write_position_ordering() {
        let complete = WritePosition::complete(5);
        assert!(complete.admits(&event(6)).is_ok());
        assert!(complete.admits(&event(5)).is_err());
        assert!(complete.admits(&event(4)).is_err());

        let open = WritePosition::of(&event(7).with_fragment(0, false));
        assert!(open.admits(&event(7).with_fragment(1, true)).is_ok());
        assert!(open.admits(&event(7).with_fragment(0, true)).is_err());

        let filtered = WritePosition::of(&ReplEvent::filtered(10, 20));
        assert!(filtered.admits(&event(15)).is_err());
        assert!(filtered.admits(&event(21)).is_ok());
    }

    #[test]
    fn store_then_read() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let mut writer = log.connect(false).unwrap();
        for seqno in 1..=3 {
            writer.store(&event(seqno), true).unwrap();
        }

        let mut reader = log.connect(true).unwrap();
        assert_eq!(reader.state(), ConnectionState::Unpositioned);
        assert!(reader.seek(1, 0).unwrap());
        for seqno in 1..=3 {
            let got = reader.next(false).unwrap().unwrap();
            assert_eq!(got, event(seqno));
        }
        assert_eq!(reader.next(false).unwrap(), None);
        assert_eq!(reader.state(), ConnectionState::Consuming);
    }

    #[test]
    fn next_requires_seek() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let mut reader = log.connect(true).unwrap();
        assert!(matches!(reader.next(false), Err(LogError::NotPositioned)));
        assert!(matches!(reader.commit(), Err(LogError::NotPositioned)));
    }

    #[test]
    fn reader_cannot_store() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let mut reader = log.connect(true).unwrap();
        assert!(matches!(
            reader.store(&event(1), true),
            Err(LogError::NotWritable { .. })
        ));
    }

    #[test]
    fn out_of_order_store_poisons_connection() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let mut writer = log.connect(false).unwrap();
        writer.store(&event(1), true).unwrap();
        writer.store(&event(2), true).unwrap();
        let length = fs::metadata(dir.path().join(log.last_file().unwrap()))
            .unwrap()
            .len();

        assert!(matches!(
            writer.store(&event(2), true),
            Err(LogError::SequenceOrder { .. })
        ));
        // Even a valid event is now refused.
        assert!(matches!(
            writer.store(&event(3), true),
            Err(LogError::SequenceOrder { .. })
        ));
        let after = fs::metadata(dir.path().join(log.last_file().unwrap()))
            .unwrap()
            .len();
        assert_eq!(length, after);
        assert_eq!(log.max_seqno(), Some(2));

        // A fresh writer continues from the shared position.
        writer.release().unwrap();
        let mut writer = log.connect(false).unwrap();
        writer.store(&event(3), true).unwrap();
        assert_eq!(log.max_seqno(), Some(3));
    }

    #[test]
    fn fragments_stay_in_one_segment() {
        let dir = tempdir().unwrap();
        let log = DiskLog::open(LogConfig::new(dir.path()).max_segment_size(64)).unwrap();
        let mut writer = log.connect(false).unwrap();
        for fragno in 0..4u16 {
            let frag = event(1).with_fragment(fragno, fragno == 3);
            writer.store(&frag, false).unwrap();
        }
        assert_eq!(log.file_count(), 1);

        writer.store(&event(2), true).unwrap();
        assert_eq!(log.file_count(), 2);
        assert_eq!(log.max_seqno(), Some(2));
        log.validate().unwrap();
    }

    #[test]
    fn seek_beyond_end_waits_at_tail() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let mut writer = log.connect(false).unwrap();
        writer.store(&event(1), true).unwrap();

        let mut reader = log.connect(true).unwrap();
        assert!(reader.seek(2, 0).unwrap());
        assert_eq!(reader.next(false).unwrap(), None);
        assert!(reader.next(true).unwrap_err().is_timeout());

        writer.store(&event(2), true).unwrap();
        assert_eq!(reader.next(false).unwrap().unwrap().seqno, 2);
    }

    #[test]
    fn seek_into_gap_fails() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let mut writer = log.connect(false).unwrap();
        writer.store(&event(1), true).unwrap();
        writer.store(&event(5), true).unwrap();

        let mut reader = log.connect(true).unwrap();
        assert!(!reader.seek(3, 0).unwrap());
        assert_eq!(reader.state(), ConnectionState::Unpositioned);
        assert!(!reader.seek(0, 0).unwrap());
    }

    #[test]
    fn seek_inside_gap_then_read_past_it() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let mut writer = log.connect(false).unwrap();
        writer.store(&event(9), false).unwrap();
        writer.store(&ReplEvent::filtered(10, 20), false).unwrap();
        writer.store(&event(21), false).unwrap();
        writer.store(&event(22), true).unwrap();

        let mut reader = log.connect(true).unwrap();
        assert!(reader.seek(15, 0).unwrap());
        let gap = reader.next(false).unwrap().unwrap();
        assert_eq!((gap.seqno, gap.seqno_end()), (10, 20));
        assert_eq!(reader.next(false).unwrap(), Some(event(21)));
        assert_eq!(reader.next(false).unwrap(), Some(event(22)));
        assert_eq!(reader.next(false).unwrap(), None);
    }

    #[test]
    fn missing_rotation_successor_times_out() {
        let dir = tempdir().unwrap();
        let log = DiskLog::open(
            LogConfig::new(dir.path())
                .max_segment_size(64)
                .rotate_timeout(Duration::from_millis(100)),
        )
        .unwrap();
        let mut writer = log.connect(false).unwrap();
        writer.store(&event(1), true).unwrap();
        writer.store(&event(2), true).unwrap();
        writer.release().unwrap();
        assert_eq!(log.file_count(), 2);
        fs::remove_file(dir.path().join(log.last_file().unwrap())).unwrap();

        let mut reader = log.connect(true).unwrap();
        assert!(reader.seek(1, 0).unwrap());
        assert_eq!(reader.next(false).unwrap(), Some(event(1)));
        let err = reader.next(false).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[test]
    fn log_release_ends_blocking_read() {
        let dir = tempdir().unwrap();
        let log = DiskLog::open(LogConfig::new(dir.path()).read_timeout(Duration::from_secs(10)))
            .unwrap();
        let mut writer = log.connect(false).unwrap();
        writer.store(&event(1), true).unwrap();
        writer.release().unwrap();

        let mut reader = log.connect(true).unwrap();
        assert!(reader.seek(2, 0).unwrap());
        let releaser = {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                log.release();
            })
        };

        let started = std::time::Instant::now();
        assert!(matches!(reader.next(true), Err(LogError::AlreadyReleased)));
        assert!(started.elapsed() < Duration::from_secs(5));
        releaser.join().unwrap();
    }

    #[test]
    fn reader_follows_rotation_across_threads() {
        let dir = tempdir().unwrap();
        let log = DiskLog::open(
            LogConfig::new(dir.path())
                .max_segment_size(128)
                .read_timeout(Duration::from_secs(5)),
        )
        .unwrap();
        let mut writer = log.connect(false).unwrap();
        writer.store(&event(1), true).unwrap();

        let mut reader = log.connect(true).unwrap();
        assert!(reader.seek(1, 0).unwrap());
        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 20 {
                let event = reader.next(true).unwrap().unwrap();
                seen.push(event.seqno);
            }
            seen
        });

        for seqno in 2..=20 {
            writer.store(&event(seqno), true).unwrap();
        }
        let seen = consumer.join().unwrap();
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());
        assert!(log.file_count() > 1);
    }

    #[test]
    fn release_semantics() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let mut writer = log.connect(false).unwrap();
        assert!(matches!(
            log.connect(false),
            Err(LogError::WriterAlreadyExists)
        ));
        writer.release().unwrap();
        assert!(matches!(writer.release(), Err(LogError::AlreadyReleased)));
        assert!(matches!(
            writer.store(&event(1), true),
            Err(LogError::AlreadyReleased)
        ));

        let writer = log.connect(false).unwrap();
        drop(writer);
        assert!(log.connect(false).is_ok());
    }

    #[test]
    fn idle_readers_are_evicted_on_connect() {
        let dir = tempdir().unwrap();
        let log = DiskLog::open(LogConfig::new(dir.path()).idle_timeout(Duration::from_millis(10)))
            .unwrap();
        let mut idle = log.connect(true).unwrap();
        thread::sleep(Duration::from_millis(30));
        let _fresh = log.connect(true).unwrap();

        assert_eq!(idle.state(), ConnectionState::Released);
        assert!(matches!(idle.seek(1, 0), Err(LogError::AlreadyReleased)));
    }
}
