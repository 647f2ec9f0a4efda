//! The disk log: directory, index, segments and connections.

use crate::config::LogConfig;
use crate::connection::{LogConnection, WritePosition};
use crate::error::{LogError, LogResult};
use crate::flush::{FlushRegistry, FlushScheduler};
use crate::index::{IndexEntry, SegmentIndex};
use crate::lock::WriteLock;
use crate::manager::ConnectionManager;
use crate::record::{decode_event_header, encode_rotate, RecordType};
use crate::recovery::{self, RecoverySummary};
use crate::segment::{
    list_segment_files, next_file_index, ReadOutcome, SegmentFile, SegmentOptions, HEADER_SIZE,
};
use crate::serializer::{serializer_by_name, EventSerializer};
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long `release` waits for the flush thread.
const FLUSH_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A segmented, append-only log of replication events.
///
/// Opening a log prepares the directory, takes the write lock (falling back
/// to read-only if another process holds it), builds the segment index and
/// repairs the tail. Events are read and written through
/// [`LogConnection`]s obtained from [`DiskLog::connect`].
///
/// # Example
///
/// ```no_run
/// use disklog_core::{DiskLog, LogConfig, ReplEvent};
///
/// let log = DiskLog::open(LogConfig::new("/var/lib/disklog"))?;
///
/// let mut writer = log.connect(false)?;
/// writer.store(&ReplEvent::new(1, b"payload".to_vec()), true)?;
///
/// let mut reader = log.connect(true)?;
/// assert!(reader.seek(1, 0)?);
/// let event = reader.next(false)?.expect("event 1");
/// assert_eq!(event.seqno, 1);
/// # Ok::<(), disklog_core::LogError>(())
/// ```
pub struct DiskLog {
    config: LogConfig,
    options: SegmentOptions,
    read_only: bool,
    serializer: Arc<dyn EventSerializer>,
    index: Mutex<SegmentIndex>,
    /// Position of the last event written, shared by successive writers.
    write_position: Mutex<Option<WritePosition>>,
    lock: Mutex<WriteLock>,
    registry: FlushRegistry,
    flusher: Mutex<Option<FlushScheduler>>,
    manager: ConnectionManager,
    recovery: RecoverySummary,
    released: AtomicBool,
}

impl fmt::Debug for DiskLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskLog")
            .field("log_dir", &self.config.log_dir)
            .field("read_only", &self.read_only)
            .field("serializer", &self.serializer.name())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl DiskLog {
    /// Opens the log described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a bad configuration, `LogConsistency` if
    /// a read-only log has no directory or segments, or any error raised
    /// while building the index or repairing the tail.
    pub fn open(config: LogConfig) -> LogResult<Arc<Self>> {
        config.validate()?;
        let dir = config.log_dir.clone();

        if !dir.exists() {
            if config.read_only {
                return Err(LogError::consistency(format!(
                    "log directory does not exist: {}",
                    dir.display()
                )));
            }
            fs::create_dir_all(&dir)?;
        } else if !dir.is_dir() {
            return Err(LogError::consistency(format!(
                "log path is not a directory: {}",
                dir.display()
            )));
        }

        let mut lock = WriteLock::new(&dir);
        let read_only = if config.read_only {
            true
        } else if lock.acquire() {
            false
        } else {
            warn!(dir = %dir.display(), "log is locked by another writer; opening read-only");
            true
        };

        let serializer = serializer_by_name(&config.serializer)?;
        let options = SegmentOptions::from_config(&config);

        if list_segment_files(&dir)?.is_empty() {
            if read_only {
                return Err(LogError::consistency(format!(
                    "log directory holds no segments: {}",
                    dir.display()
                )));
            }
            SegmentFile::create(&dir, 1, None, options, None)?.close()?;
            info!(dir = %dir.display(), "created initial segment");
        }

        let mut index = SegmentIndex::build(&dir, options, config.retention)?;
        let summary = recovery::recover(&mut index, options, read_only)?;

        let registry = FlushRegistry::new();
        let flusher = if config.async_flush() && !read_only {
            Some(FlushScheduler::start(registry.clone(), config.flush_interval)?)
        } else {
            None
        };

        info!(
            dir = %dir.display(),
            read_only,
            segments = index.len(),
            max_seqno = ?index.max_seqno(),
            serializer = serializer.name(),
            "disk log prepared"
        );

        Ok(Arc::new(Self {
            config,
            options,
            read_only,
            serializer,
            index: Mutex::new(index),
            write_position: Mutex::new(summary.max_seqno.map(WritePosition::complete)),
            lock: Mutex::new(lock),
            registry,
            flusher: Mutex::new(flusher),
            manager: ConnectionManager::new(),
            recovery: summary,
            released: AtomicBool::new(false),
        }))
    }

    /// Opens a connection.
    ///
    /// Read connections idle for longer than the configured idle timeout
    /// are released first.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyReleased` after [`release`](Self::release),
    /// `NotWritable` for a write connection on a read-only log, or
    /// `WriterAlreadyExists` if a write connection is already open.
    pub fn connect(self: &Arc<Self>, read_only: bool) -> LogResult<LogConnection> {
        self.ensure_open()?;
        if !read_only && self.read_only {
            return Err(LogError::not_writable("log is open read-only"));
        }
        self.manager.release_idle(self.config.idle_timeout);
        let shared = self.manager.register(read_only)?;
        Ok(LogConnection::new(Arc::clone(self), shared))
    }

    /// Closes `current` with a ROTATE record and returns its successor,
    /// created with `next_seqno` as its base and open for write.
    ///
    /// # Errors
    ///
    /// Returns a storage error or `LogConsistency` if the index rejects the
    /// new segment.
    pub fn rotate(&self, current: &mut SegmentFile, next_seqno: u64) -> LogResult<SegmentFile> {
        let next_index = next_file_index(current.index());
        let marker = encode_rotate(next_index, self.config.checksum_kind());
        current.write_record(&marker, u64::MAX)?;
        current.close()?;

        let next = SegmentFile::create(
            self.dir(),
            next_index,
            Some(next_seqno),
            self.options,
            self.registry(),
        )?;
        let purged = self.index.lock().add_new_file(next_seqno, next.name())?;
        info!(
            from = current.name(),
            to = next.name(),
            next_seqno,
            purged = purged.len(),
            "rotated segment"
        );
        Ok(next)
    }

    /// Opens the newest segment for appends.
    ///
    /// # Errors
    ///
    /// Returns `LogConsistency` if the index is empty, or a storage error.
    pub fn open_tail_for_write(&self) -> LogResult<SegmentFile> {
        if self.read_only {
            return Err(LogError::not_writable("log is open read-only"));
        }
        let name = self
            .index
            .lock()
            .last_file()
            .map(|e| e.file_name.clone())
            .ok_or_else(|| LogError::consistency("index has no segments"))?;
        let mut segment = SegmentFile::from_name(self.dir(), &name, self.options)?;
        segment.open_write(self.registry())?;
        Ok(segment)
    }

    /// Deletes events in `[low, high]`.
    ///
    /// `None` bounds extend to the start or end of the log. The range must
    /// touch one end of the log; deleting everything leaves one empty
    /// segment. Deleting from the start removes only whole segments, so
    /// events sharing a segment with `high + 1` remain.
    ///
    /// # Errors
    ///
    /// Returns `NotWritable` on a read-only log or while a write connection
    /// is open, and `InvalidRange` for a range in the middle of the log.
    pub fn delete(&self, low: Option<u64>, high: Option<u64>) -> LogResult<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(LogError::not_writable("log is open read-only"));
        }
        if self.manager.has_writer() {
            return Err(LogError::not_writable(
                "cannot delete while a write connection is open",
            ));
        }
        if let (Some(l), Some(h)) = (low, high) {
            if l > h {
                return Err(LogError::invalid_range(format!("low {l} exceeds high {h}")));
            }
        }

        let mut index = self.index.lock();
        let (Some(min), Some(max)) = (index.min_seqno(), index.max_seqno()) else {
            if low.is_none() && high.is_none() {
                self.reset(&mut index)?;
            }
            return Ok(());
        };

        match (low.filter(|&l| l > min), high.filter(|&h| h < max)) {
            (None, None) => self.reset(&mut index),
            (Some(low), None) => self.delete_tail(&mut index, low),
            (None, Some(high)) => self.delete_head(&mut index, high),
            (Some(low), Some(high)) => Err(LogError::invalid_range(format!(
                "[{low}, {high}] touches neither the start ({min}) nor the end ({max}) of the log"
            ))),
        }
    }

    /// Removes every segment and starts over with one empty segment.
    fn reset(&self, index: &mut SegmentIndex) -> LogResult<()> {
        let names: Vec<String> = index.entries().iter().map(|e| e.file_name.clone()).collect();
        for name in &names {
            fs::remove_file(self.dir().join(name))?;
        }
        let fresh = SegmentFile::create(self.dir(), 1, None, self.options, None)?;
        index.reset(fresh.name());
        *self.write_position.lock() = None;
        info!(removed = names.len(), "deleted all events");
        Ok(())
    }

    /// Removes whole segments that end at or below `high`, never the newest.
    fn delete_head(&self, index: &mut SegmentIndex, high: u64) -> LogResult<()> {
        let entries = index.entries();
        let doomed: Vec<String> = entries[..entries.len().saturating_sub(1)]
            .iter()
            .take_while(|e| e.end_seqno <= high)
            .map(|e| e.file_name.clone())
            .collect();
        for name in &doomed {
            fs::remove_file(self.dir().join(name))?;
            index.remove_file(name);
        }
        info!(high, removed = doomed.len(), "deleted segments from the start");
        Ok(())
    }

    /// Cuts the log before the first event at or above `low`.
    fn delete_tail(&self, index: &mut SegmentIndex, low: u64) -> LogResult<()> {
        let Some(containing) = index.get_file(low).cloned() else {
            return Err(LogError::invalid_range(format!(
                "seqno {low} is below the start of the log"
            )));
        };

        let later: Vec<String> = index
            .entries()
            .iter()
            .skip_while(|e| e.file_name != containing.file_name)
            .skip(1)
            .map(|e| e.file_name.clone())
            .collect();
        for name in later.iter().rev() {
            fs::remove_file(self.dir().join(name))?;
            index.remove_file(name);
        }

        let mut name = containing.file_name;
        let mut cut_from = Some(low);
        let new_max = loop {
            let (cut, last_seqno) = self.find_cut(&name, cut_from)?;
            self.truncate_segment(&name, cut)?;
            if cut > HEADER_SIZE || index.len() == 1 {
                break last_seqno;
            }
            // The segment is now empty; drop it and the ROTATE pointing at it.
            fs::remove_file(self.dir().join(&name))?;
            index.remove_file(&name);
            name = match index.last_file() {
                Some(entry) => entry.file_name.clone(),
                None => return Err(LogError::consistency("index has no segments")),
            };
            cut_from = None;
        };

        match new_max {
            Some(max) => index.set_max_indexed_seqno(max),
            None => index.clear_max_indexed_seqno(),
        }
        *self.write_position.lock() = new_max.map(WritePosition::complete);
        info!(low, max_seqno = ?new_max, removed = later.len(), "deleted events from the end");
        Ok(())
    }

    /// Finds where to cut `name`: before the first event at or above
    /// `from`, or before a trailing ROTATE record. Returns the offset and
    /// the last complete seqno before it.
    fn find_cut(&self, name: &str, from: Option<u64>) -> LogResult<(u64, Option<u64>)> {
        let mut segment = SegmentFile::from_name(self.dir(), name, self.options)?;
        segment.open_read()?;
        let mut last_seqno = None;
        loop {
            match segment.read_record(Duration::ZERO)? {
                ReadOutcome::Record(record) => match record.record_type() {
                    Some(RecordType::Event) => {
                        let (header, _) = decode_event_header(&record)?;
                        if from.is_some_and(|low| header.seqno >= low) {
                            return Ok((record.offset, last_seqno));
                        }
                        if header.last_frag {
                            last_seqno = Some(header.seqno_end);
                        }
                    }
                    Some(RecordType::Rotate) => return Ok((record.offset, last_seqno)),
                    None => {
                        return Err(LogError::corrupt_record(
                            record.offset,
                            "unknown record type",
                        ))
                    }
                },
                ReadOutcome::Empty | ReadOutcome::Truncated => {
                    return Ok((segment.offset()?, last_seqno))
                }
            }
        }
    }

    fn truncate_segment(&self, name: &str, length: u64) -> LogResult<()> {
        let mut segment = SegmentFile::from_name(self.dir(), name, self.options)?;
        if segment.length()? == length {
            return Ok(());
        }
        segment.open_write(None)?;
        segment.set_length(length)?;
        segment.close()
    }

    /// Releases every connection, stops background flushing and gives up
    /// the write lock. Further operations fail with `AlreadyReleased`.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections = self.manager.release_all();
        if let Some(mut flusher) = self.flusher.lock().take() {
            flusher.stop(FLUSH_JOIN_TIMEOUT);
        }
        self.registry.flush_all();
        self.lock.lock().release();
        info!(dir = %self.dir().display(), connections, "disk log released");
    }

    /// What recovery repaired when the log was opened.
    #[must_use]
    pub fn recovery_summary(&self) -> &RecoverySummary {
        &self.recovery
    }

    /// Returns true once released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns true if the log was opened, or fell back to, read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.config.log_dir
    }

    /// Configuration the log was opened with.
    #[must_use]
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Human-readable dump of the segment index.
    #[must_use]
    pub fn index_dump(&self) -> String {
        self.index.lock().to_string()
    }

    /// Snapshot of the index entries.
    #[must_use]
    pub fn index_entries(&self) -> Vec<IndexEntry> {
        self.index.lock().entries().to_vec()
    }

    /// Name of the oldest segment.
    #[must_use]
    pub fn first_file(&self) -> Option<String> {
        self.index.lock().first_file().map(|e| e.file_name.clone())
    }

    /// Name of the newest segment.
    #[must_use]
    pub fn last_file(&self) -> Option<String> {
        self.index.lock().last_file().map(|e| e.file_name.clone())
    }

    /// Smallest seqno in the log.
    #[must_use]
    pub fn min_seqno(&self) -> Option<u64> {
        self.index.lock().min_seqno()
    }

    /// Largest complete seqno in the log.
    #[must_use]
    pub fn max_seqno(&self) -> Option<u64> {
        self.index.lock().max_seqno()
    }

    /// Number of segment files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.index.lock().len()
    }

    /// Sets the seqno below which retention may purge segments.
    pub fn set_active_seqno(&self, seqno: Option<u64>) {
        self.index.lock().set_active_seqno(seqno);
    }

    /// Applies the retention policy now and returns the purged file names.
    pub fn purge(&self) -> Vec<String> {
        self.index.lock().purge()
    }

    /// Checks the index against the directory.
    ///
    /// # Errors
    ///
    /// Returns `LogConsistency` describing the first problem found.
    pub fn validate(&self) -> LogResult<()> {
        self.index.lock().validate()
    }

    fn ensure_open(&self) -> LogResult<()> {
        if self.is_released() {
            Err(LogError::AlreadyReleased)
        } else {
            Ok(())
        }
    }

    fn registry(&self) -> Option<&FlushRegistry> {
        (self.config.async_flush() && !self.read_only).then_some(&self.registry)
    }

    pub(crate) fn options(&self) -> SegmentOptions {
        self.options
    }

    pub(crate) fn serializer(&self) -> &dyn EventSerializer {
        self.serializer.as_ref()
    }

    pub(crate) fn index(&self) -> &Mutex<SegmentIndex> {
        &self.index
    }

    pub(crate) fn write_position(&self) -> &Mutex<Option<WritePosition>> {
        &self.write_position
    }

    pub(crate) fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Drop for DiskLog {
    fn drop(&mut self) {
        self.release();
    }
}
