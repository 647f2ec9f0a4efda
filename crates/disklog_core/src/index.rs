//! In-memory index mapping seqno ranges to segment files.

use crate::error::{LogError, LogResult};
use crate::record::{decode_event_header, RecordType};
use crate::segment::{list_segment_files, ReadOutcome, SegmentFile, SegmentOptions, HEADER_SIZE};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// End seqno of the newest segment, which is still open.
pub const OPEN_END: u64 = u64::MAX;

/// One segment and the seqno range it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// First seqno in the segment.
    pub start_seqno: u64,
    /// Last seqno in the segment, or [`OPEN_END`] for the newest segment.
    pub end_seqno: u64,
    /// Segment file name.
    pub file_name: String,
}

impl IndexEntry {
    fn new(start_seqno: u64, file_name: impl Into<String>) -> Self {
        Self {
            start_seqno,
            end_seqno: OPEN_END,
            file_name: file_name.into(),
        }
    }

    /// Returns true if `seqno` falls within this entry.
    #[must_use]
    pub fn contains(&self, seqno: u64) -> bool {
        self.start_seqno <= seqno && seqno <= self.end_seqno
    }
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end_seqno == OPEN_END {
            write!(f, "{} [{}, open)", self.file_name, self.start_seqno)
        } else {
            write!(
                f,
                "{} [{}, {}]",
                self.file_name, self.start_seqno, self.end_seqno
            )
        }
    }
}

/// Sorted, contiguous list of segments.
///
/// Lives behind a single mutex inside the log; every method assumes the
/// caller holds it.
#[derive(Debug)]
pub struct SegmentIndex {
    dir: PathBuf,
    entries: Vec<IndexEntry>,
    /// Highest seqno whose transaction is complete on disk.
    max_indexed: Option<u64>,
    retention: Option<Duration>,
    /// Purge keeps segments whose end reaches this seqno.
    active_seqno: Option<u64>,
}

impl SegmentIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(dir: &Path, retention: Option<Duration>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            entries: Vec::new(),
            max_indexed: None,
            retention,
            active_seqno: None,
        }
    }

    /// Scans `dir` and builds the index from segment headers.
    ///
    /// A segment created before its first seqno was known has its start
    /// recovered from its first event record.
    ///
    /// # Errors
    ///
    /// Returns a storage error, `InvalidHeader`, or `LogConsistency` if a
    /// segment after the first has no recoverable start.
    pub fn build(
        dir: &Path,
        options: SegmentOptions,
        retention: Option<Duration>,
    ) -> LogResult<Self> {
        let mut index = Self::new(dir, retention);
        let names = list_segment_files(dir)?;
        let count = names.len();
        for (position, name) in names.into_iter().enumerate() {
            let mut segment = SegmentFile::from_name(dir, &name, options)?;
            if position + 1 == count && segment.length()? < HEADER_SIZE {
                // Interrupted creation; recovery removes it.
                warn!(file = %name, "newest segment has no complete header");
                let start = index.entries.last().map_or(0, |e| e.start_seqno);
                index.entries.push(IndexEntry::new(start, name));
                continue;
            }
            segment.open_read()?;
            let base = match segment.header().and_then(|h| h.base_seqno) {
                Some(base) => Some(base),
                None => first_event_seqno(&mut segment)?,
            };
            let start = match base {
                Some(start) => start,
                None if position == 0 => 0,
                None => {
                    return Err(LogError::consistency(format!(
                        "segment {name} has no base seqno and no events"
                    )))
                }
            };
            debug!(file = %name, start, "indexed segment");
            index.entries.push(IndexEntry::new(start, name));
        }
        index.stitch();
        Ok(index)
    }

    /// Closes each entry at the start of its successor.
    fn stitch(&mut self) {
        let count = self.entries.len();
        for i in 0..count {
            self.entries[i].end_seqno = if i + 1 < count {
                self.entries[i + 1].start_seqno.saturating_sub(1)
            } else {
                OPEN_END
            };
        }
    }

    /// Directory the index describes.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All entries in order.
    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no segments are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the segment holding `seqno`.
    ///
    /// Seqnos below the minimum have no segment; seqnos above the maximum
    /// resolve to the newest segment.
    #[must_use]
    pub fn get_file(&self, seqno: u64) -> Option<&IndexEntry> {
        let first = self.entries.first()?;
        if seqno < first.start_seqno {
            return None;
        }
        let pos = self.entries.partition_point(|e| e.start_seqno <= seqno);
        self.entries.get(pos.saturating_sub(1))
    }

    /// Records the highest complete seqno.
    ///
    /// While the log holds no events the newest entry's start is a
    /// placeholder; the first recorded seqno replaces it.
    pub fn set_max_indexed_seqno(&mut self, seqno: u64) {
        if self.max_indexed.is_none() {
            self.set_first_seqno(seqno);
        }
        self.max_indexed = Some(seqno);
    }

    /// Sets the start of an empty log to `seqno`. Does nothing once the log
    /// holds events.
    pub fn set_first_seqno(&mut self, seqno: u64) {
        if self.max_indexed.is_some() {
            return;
        }
        if let [only] = self.entries.as_mut_slice() {
            if only.start_seqno == 0 {
                only.start_seqno = seqno;
            }
        }
    }

    /// Clears the recorded maximum, as for a log with no events.
    pub fn clear_max_indexed_seqno(&mut self) {
        self.max_indexed = None;
    }

    /// Appends a new segment starting at `start_seqno` and closes the
    /// previous one. Triggers a retention purge.
    ///
    /// # Errors
    ///
    /// Returns `LogConsistency` if `start_seqno` would overlap the previous
    /// segment.
    pub fn add_new_file(&mut self, start_seqno: u64, file_name: &str) -> LogResult<Vec<String>> {
        if let Some(last) = self.entries.last_mut() {
            if start_seqno < last.start_seqno {
                return Err(LogError::consistency(format!(
                    "new segment {file_name} starts at {start_seqno}, before {}",
                    last
                )));
            }
            last.end_seqno = start_seqno.saturating_sub(1);
        }
        self.entries.push(IndexEntry::new(start_seqno, file_name));
        Ok(self.purge())
    }

    /// Removes the entry for `file_name`; the file itself is not touched.
    /// Returns whether an entry was removed.
    pub fn remove_file(&mut self, file_name: &str) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.file_name == file_name) else {
            return false;
        };
        self.entries.remove(pos);
        if let Some(last) = self.entries.last_mut() {
            last.end_seqno = OPEN_END;
        }
        true
    }

    /// Replaces all entries with one empty segment.
    pub fn reset(&mut self, file_name: &str) {
        self.entries = vec![IndexEntry::new(0, file_name)];
        self.max_indexed = None;
    }

    /// Sets the seqno that retention must not purge past.
    pub fn set_active_seqno(&mut self, seqno: Option<u64>) {
        self.active_seqno = seqno;
    }

    /// Seqno retention must not purge past.
    #[must_use]
    pub fn active_seqno(&self) -> Option<u64> {
        self.active_seqno
    }

    /// Deletes old segments from the front of the log.
    ///
    /// A segment is purged when it is older than the retention window and
    /// ends below the active seqno. The two newest segments are always kept
    /// and purging stops at the first segment that must stay.
    pub fn purge(&mut self) -> Vec<String> {
        let Some(retention) = self.retention else {
            return Vec::new();
        };
        let now = SystemTime::now();
        let mut purged = Vec::new();

        while self.entries.len() > 2 {
            let entry = &self.entries[0];
            if self.active_seqno.is_some_and(|active| entry.end_seqno >= active) {
                break;
            }
            let path = self.dir.join(&entry.file_name);
            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if !age.is_some_and(|age| age > retention) {
                break;
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %entry.file_name, error = %e, "failed to purge segment");
                break;
            }
            let entry = self.entries.remove(0);
            info!(file = %entry.file_name, end = entry.end_seqno, "purged segment");
            purged.push(entry.file_name);
        }
        purged
    }

    /// Checks that every segment exists and ranges are contiguous.
    ///
    /// # Errors
    ///
    /// Returns `LogConsistency` describing the first violation.
    pub fn validate(&self) -> LogResult<()> {
        let Some(last) = self.entries.last() else {
            return Err(LogError::consistency("index has no segments"));
        };
        for entry in &self.entries {
            if !self.dir.join(&entry.file_name).is_file() {
                return Err(LogError::consistency(format!(
                    "indexed segment {} is missing",
                    entry.file_name
                )));
            }
            // An empty segment closed right after creation ends just below
            // its start.
            if entry.end_seqno.saturating_add(1) < entry.start_seqno {
                return Err(LogError::consistency(format!("inverted range: {entry}")));
            }
        }
        for pair in self.entries.windows(2) {
            if pair[0].end_seqno.saturating_add(1) != pair[1].start_seqno {
                return Err(LogError::consistency(format!(
                    "segments are not contiguous: {} then {}",
                    pair[0], pair[1]
                )));
            }
        }
        if last.end_seqno != OPEN_END {
            return Err(LogError::consistency(format!(
                "newest segment is closed: {last}"
            )));
        }
        Ok(())
    }

    /// Smallest seqno in the log, if it holds events.
    #[must_use]
    pub fn min_seqno(&self) -> Option<u64> {
        self.max_indexed?;
        self.entries.first().map(|e| e.start_seqno)
    }

    /// Largest complete seqno in the log, if it holds events.
    #[must_use]
    pub fn max_seqno(&self) -> Option<u64> {
        self.max_indexed
    }

    /// Oldest segment.
    #[must_use]
    pub fn first_file(&self) -> Option<&IndexEntry> {
        self.entries.first()
    }

    /// Newest segment.
    #[must_use]
    pub fn last_file(&self) -> Option<&IndexEntry> {
        self.entries.last()
    }
}

impl fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_indexed {
            Some(max) => writeln!(f, "segments: {} max_seqno: {max}", self.entries.len())?,
            None => writeln!(f, "segments: {} (no events)", self.entries.len())?,
        }
        for entry in &self.entries {
            writeln!(f, "  {entry}")?;
        }
        Ok(())
    }
}

/// Returns the seqno of the first event in an open-for-read segment.
fn first_event_seqno(segment: &mut SegmentFile) -> LogResult<Option<u64>> {
    loop {
        match segment.read_record(Duration::ZERO)? {
            ReadOutcome::Record(record) => {
                if record.record_type() == Some(RecordType::Event) {
                    let (header, _) = decode_event_header(&record)?;
                    return Ok(Some(header.seqno));
                }
            }
            ReadOutcome::Empty | ReadOutcome::Truncated => return Ok(None),
        }
    }
}
