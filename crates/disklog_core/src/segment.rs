//! Segment files.
//!
//! ```text
//! <log_dir>/
//! ├─ disklog.lck              # Write lock
//! ├─ log.data.0000000001      # Oldest segment
//! ├─ log.data.0000000002
//! └─ log.data.0000000003      # Active segment
//! ```
//!
//! Each segment starts with a 16-byte header followed by framed records:
//!
//! ```text
//! | magic (4) | major (2) | minor (2) | base_seqno (8, i64, -1 = unknown) |
//! ```
//!
//! Every segment except the newest ends with a ROTATE record naming its
//! successor.

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::flush::FlushRegistry;
use crate::record::{LogRecord, LENGTH_PREFIX};
use disklog_storage::{FileBackend, StorageBackend};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Segment file name prefix.
pub const SEGMENT_PREFIX: &str = "log.data.";

/// Magic number opening every segment.
pub const SEGMENT_MAGIC: u32 = 0xC001_CAFE;

/// Segment format major version. Readers reject other majors.
pub const MAJOR_VERSION: u16 = 1;

/// Segment format minor version.
pub const MINOR_VERSION: u16 = 1;

/// Size of the segment header.
pub const HEADER_SIZE: u64 = 16;

/// Digits in a file index (the digit count of `i32::MAX`).
const INDEX_DIGITS: usize = 10;

/// Largest file index before wrapping back to 1.
pub const MAX_FILE_INDEX: u32 = i32::MAX as u32;

/// Step between polls while waiting for data.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Returns the file name for a segment index.
#[must_use]
pub fn segment_file_name(index: u32) -> String {
    format!("{SEGMENT_PREFIX}{index:0width$}", width = INDEX_DIGITS)
}

/// Parses the index out of a segment file name.
#[must_use]
pub fn parse_file_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?;
    if digits.len() != INDEX_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    (1..=MAX_FILE_INDEX).contains(&index).then_some(index)
}

/// Returns the index following `index`, wrapping at `i32::MAX`.
#[must_use]
pub fn next_file_index(index: u32) -> u32 {
    if index >= MAX_FILE_INDEX {
        1
    } else {
        index + 1
    }
}

/// Lists segment file names in `dir`, ordered by index.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be read.
pub fn list_segment_files(dir: &Path) -> LogResult<Vec<String>> {
    let mut files: Vec<(u32, String)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Some(index) = parse_file_index(name) {
                files.push((index, name.to_string()));
            }
        }
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files.into_iter().map(|(_, name)| name).collect())
}

/// Polls `attempt` until it yields a value or `timeout` elapses.
///
/// A zero timeout makes exactly one attempt.
pub(crate) fn poll_until<T>(
    timeout: Duration,
    waiting_for: impl Fn() -> String,
    mut attempt: impl FnMut() -> LogResult<Option<T>>,
) -> LogResult<T> {
    let start = Instant::now();
    let deadline = start + timeout;
    loop {
        if let Some(value) = attempt()? {
            return Ok(value);
        }
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(rem) if !rem.is_zero() => rem,
            _ => return Err(LogError::timeout(waiting_for(), start.elapsed())),
        };
        thread::sleep(POLL_INTERVAL.min(remaining));
    }
}

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format major version.
    pub major: u16,
    /// Format minor version.
    pub minor: u16,
    /// First seqno stored in the segment, if known at creation.
    pub base_seqno: Option<u64>,
}

impl SegmentHeader {
    /// Header for a new segment at the current format version.
    #[must_use]
    pub fn new(base_seqno: Option<u64>) -> Self {
        Self {
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
            base_seqno,
        }
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let base = self
            .base_seqno
            .and_then(|s| i64::try_from(s).ok())
            .unwrap_or(-1);
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.major.to_le_bytes());
        buf[6..8].copy_from_slice(&self.minor.to_le_bytes());
        buf[8..16].copy_from_slice(&base.to_le_bytes());
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeader` for a short buffer, wrong magic or an
    /// unsupported major version.
    pub fn decode(bytes: &[u8], file: &str) -> LogResult<Self> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(LogError::invalid_header(
                file,
                format!("header truncated to {} bytes", bytes.len()),
            ));
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != SEGMENT_MAGIC {
            return Err(LogError::invalid_header(
                file,
                format!("bad magic {magic:#010x}"),
            ));
        }
        let major = u16::from_le_bytes([bytes[4], bytes[5]]);
        if major != MAJOR_VERSION {
            return Err(LogError::invalid_header(
                file,
                format!("unsupported major version {major}"),
            ));
        }
        let minor = u16::from_le_bytes([bytes[6], bytes[7]]);
        if minor != MINOR_VERSION {
            warn!(file, minor, expected = MINOR_VERSION, "segment minor version differs");
        }
        let mut base = [0u8; 8];
        base.copy_from_slice(&bytes[8..16]);
        let base = i64::from_le_bytes(base);

        Ok(Self {
            major,
            minor,
            base_seqno: u64::try_from(base).ok(),
        })
    }
}

/// Per-segment I/O settings.
#[derive(Debug, Clone, Copy)]
pub struct SegmentOptions {
    /// Read buffer and write staging capacity.
    pub buffer_size: usize,
    /// Largest record length accepted when reading.
    pub max_record_size: u32,
    /// Whether checksums are verified on read.
    pub verify_checksums: bool,
    /// Whether flushes fsync.
    pub fsync_on_flush: bool,
}

impl SegmentOptions {
    /// Derives segment options from a log configuration.
    #[must_use]
    pub fn from_config(config: &LogConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            max_record_size: config.max_record_size,
            verify_checksums: config.checksums,
            fsync_on_flush: config.fsync_on_flush,
        }
    }
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self::from_config(&LogConfig::default())
    }
}

/// Result of a record read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete record.
    Record(LogRecord),
    /// No bytes follow the current offset.
    Empty,
    /// Bytes follow the current offset but do not form a complete record.
    Truncated,
}

/// Append side of an open segment, shared with the flush scheduler.
pub struct SegmentWriter {
    name: String,
    path: PathBuf,
    backend: Mutex<Box<dyn StorageBackend>>,
    dirty: AtomicBool,
    fsync: bool,
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("name", &self.name)
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SegmentWriter {
    fn new(name: &str, path: &Path, backend: Box<dyn StorageBackend>, fsync: bool) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            backend: Mutex::new(backend),
            dirty: AtomicBool::new(false),
            fsync,
        }
    }

    /// Segment file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends bytes and returns the new segment length.
    fn append(&self, bytes: &[u8]) -> LogResult<u64> {
        let mut backend = self.backend.lock();
        let offset = backend
            .append(bytes)
            .map_err(|e| LogError::storage(&self.path, 0, e))?;
        self.dirty.store(true, Ordering::Release);
        Ok(offset + bytes.len() as u64)
    }

    /// Flushes staged writes, fsyncing when configured. No-op when nothing
    /// was written since the last flush.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the flush fails.
    pub fn flush(&self) -> LogResult<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut backend = self.backend.lock();
        let result = if self.fsync {
            backend.sync()
        } else {
            backend.flush()
        };
        if let Err(e) = result {
            self.dirty.store(true, Ordering::Release);
            let offset = backend.size().unwrap_or(0);
            return Err(LogError::storage(&self.path, offset, e));
        }
        Ok(())
    }

    fn length(&self) -> LogResult<u64> {
        self.backend
            .lock()
            .size()
            .map_err(|e| LogError::storage(&self.path, 0, e))
    }

    fn truncate(&self, length: u64) -> LogResult<()> {
        self.backend
            .lock()
            .truncate(length)
            .map_err(|e| LogError::storage(&self.path, length, e))
    }
}

/// Buffered sequential reader over a segment.
struct ReadState {
    backend: Box<dyn StorageBackend>,
    buffer: Vec<u8>,
    /// Position of the next unread byte in `buffer`.
    pos: usize,
    /// File offset of `buffer[pos]`.
    offset: u64,
}

impl ReadState {
    /// Ensures `min_bytes` are buffered past `pos`. Returns false if the
    /// file does not currently hold that many bytes.
    fn ensure_buffered(&mut self, min_bytes: usize, chunk: usize, path: &Path) -> LogResult<bool> {
        let available = self.buffer.len() - self.pos;
        if available >= min_bytes {
            return Ok(true);
        }

        let file_end = self
            .backend
            .size()
            .map_err(|e| LogError::storage(path, self.offset, e))?;
        let read_from = self.offset + available as u64;
        let remaining = file_end.saturating_sub(read_from);
        if (available as u64) + remaining < min_bytes as u64 {
            // Buffer the partial bytes; a writer may still complete them.
            if remaining > 0 {
                self.fill(read_from, remaining as usize, path)?;
            }
            return Ok(false);
        }

        let want = (min_bytes - available).max(chunk);
        let to_read = remaining.min(want as u64) as usize;
        self.fill(read_from, to_read, path)?;
        Ok(self.buffer.len() - self.pos >= min_bytes)
    }

    fn fill(&mut self, from: u64, len: usize, path: &Path) -> LogResult<()> {
        if self.pos > 0 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        let data = self
            .backend
            .read_at(from, len)
            .map_err(|e| LogError::storage(path, from, e))?;
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    fn available(&self) -> usize {
        self.buffer.len() - self.pos
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
        self.offset += n as u64;
    }
}

struct WriteState {
    writer: Arc<SegmentWriter>,
    registry: Option<FlushRegistry>,
}

enum Mode {
    Closed,
    Read(ReadState),
    Write(WriteState),
}

/// One segment file, closed or open for reading or writing.
///
/// Switching between modes closes the file and reopens it.
pub struct SegmentFile {
    name: String,
    path: PathBuf,
    index: u32,
    options: SegmentOptions,
    header: Option<SegmentHeader>,
    mode: Mode,
}

impl std::fmt::Debug for SegmentFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::Closed => "closed",
            Mode::Read(_) => "read",
            Mode::Write(_) => "write",
        };
        f.debug_struct("SegmentFile")
            .field("name", &self.name)
            .field("mode", &mode)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl SegmentFile {
    /// Returns a closed handle for segment `index` in `dir`.
    #[must_use]
    pub fn new(dir: &Path, index: u32, options: SegmentOptions) -> Self {
        let name = segment_file_name(index);
        Self {
            path: dir.join(&name),
            name,
            index,
            options,
            header: None,
            mode: Mode::Closed,
        }
    }

    /// Returns a closed handle for an existing segment name.
    ///
    /// # Errors
    ///
    /// Returns `LogConsistency` if `name` is not a segment file name.
    pub fn from_name(dir: &Path, name: &str, options: SegmentOptions) -> LogResult<Self> {
        let index = parse_file_index(name)
            .ok_or_else(|| LogError::consistency(format!("not a segment file name: {name}")))?;
        Ok(Self::new(dir, index, options))
    }

    /// Creates the file, writes its header and leaves it open for write.
    ///
    /// # Errors
    ///
    /// Fails if the file already exists or cannot be written.
    pub fn create(
        dir: &Path,
        index: u32,
        base_seqno: Option<u64>,
        options: SegmentOptions,
        registry: Option<&FlushRegistry>,
    ) -> LogResult<Self> {
        let mut segment = Self::new(dir, index, options);
        let mut backend = FileBackend::create_new(&segment.path, options.buffer_size)
            .map_err(|e| LogError::storage(&segment.path, 0, e))?;
        let header = SegmentHeader::new(base_seqno);
        backend
            .append(&header.encode())
            .map_err(|e| LogError::storage(&segment.path, 0, e))?;
        backend
            .flush()
            .map_err(|e| LogError::storage(&segment.path, 0, e))?;
        debug!(file = %segment.name, ?base_seqno, "created segment");

        segment.header = Some(header);
        segment.install_writer(Box::new(backend), registry);
        Ok(segment)
    }

    /// Segment file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path of the segment.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Segment index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Header read or written when the file was last opened.
    #[must_use]
    pub fn header(&self) -> Option<SegmentHeader> {
        self.header
    }

    /// Returns true when open for reading.
    #[must_use]
    pub fn is_open_for_read(&self) -> bool {
        matches!(self.mode, Mode::Read(_))
    }

    /// Returns true when open for writing.
    #[must_use]
    pub fn is_open_for_write(&self) -> bool {
        matches!(self.mode, Mode::Write(_))
    }

    /// Opens the segment for sequential reads positioned after the header.
    ///
    /// # Errors
    ///
    /// Returns a storage error or `InvalidHeader`.
    pub fn open_read(&mut self) -> LogResult<()> {
        self.close()?;
        let backend =
            FileBackend::open_read(&self.path).map_err(|e| LogError::storage(&self.path, 0, e))?;
        let header = self.read_header(&backend)?;
        self.header = Some(header);
        self.mode = Mode::Read(ReadState {
            backend: Box::new(backend),
            buffer: Vec::with_capacity(self.options.buffer_size),
            pos: 0,
            offset: HEADER_SIZE,
        });
        Ok(())
    }

    /// Opens the segment for appends at its current end.
    ///
    /// The header is validated through a separate read handle first.
    ///
    /// # Errors
    ///
    /// Returns a storage error or `InvalidHeader`.
    pub fn open_write(&mut self, registry: Option<&FlushRegistry>) -> LogResult<()> {
        self.close()?;
        let reader =
            FileBackend::open_read(&self.path).map_err(|e| LogError::storage(&self.path, 0, e))?;
        let header = self.read_header(&reader)?;
        drop(reader);

        let backend = FileBackend::open_write(&self.path, self.options.buffer_size)
            .map_err(|e| LogError::storage(&self.path, 0, e))?;
        self.header = Some(header);
        self.install_writer(Box::new(backend), registry);
        Ok(())
    }

    fn install_writer(
        &mut self,
        backend: Box<dyn StorageBackend>,
        registry: Option<&FlushRegistry>,
    ) {
        let writer = Arc::new(SegmentWriter::new(
            &self.name,
            &self.path,
            backend,
            self.options.fsync_on_flush,
        ));
        if let Some(registry) = registry {
            registry.register(Arc::clone(&writer));
        }
        self.mode = Mode::Write(WriteState {
            writer,
            registry: registry.cloned(),
        });
    }

    fn read_header(&self, backend: &FileBackend) -> LogResult<SegmentHeader> {
        let size = backend
            .size()
            .map_err(|e| LogError::storage(&self.path, 0, e))?;
        if size < HEADER_SIZE {
            return Err(LogError::invalid_header(
                &self.name,
                format!("file is {size} bytes, shorter than the header"),
            ));
        }
        let bytes = backend
            .read_at(0, HEADER_SIZE as usize)
            .map_err(|e| LogError::storage(&self.path, 0, e))?;
        SegmentHeader::decode(&bytes, &self.name)
    }

    /// Reads the next record.
    ///
    /// With a zero `max_wait` this returns immediately: `Empty` when no
    /// bytes follow, `Truncated` when only part of a record is present.
    /// Otherwise it polls until a complete record appears and fails with
    /// `Timeout` once `max_wait` elapses.
    ///
    /// # Errors
    ///
    /// Returns `CorruptLength`, `ChecksumMismatch`, a storage error, or
    /// `Timeout`.
    pub fn read_record(&mut self, max_wait: Duration) -> LogResult<ReadOutcome> {
        self.read_record_unless(max_wait, &|| false)
    }

    /// Like [`read_record`](Self::read_record), but a wait ends with
    /// `AlreadyReleased` as soon as `released` returns true.
    pub(crate) fn read_record_unless(
        &mut self,
        max_wait: Duration,
        released: &dyn Fn() -> bool,
    ) -> LogResult<ReadOutcome> {
        if max_wait.is_zero() {
            return self.try_read_record();
        }
        let name = self.name.clone();
        poll_until(
            max_wait,
            || format!("data in {name}"),
            || {
                if released() {
                    return Err(LogError::AlreadyReleased);
                }
                match self.try_read_record()? {
                    ReadOutcome::Record(record) => Ok(Some(record)),
                    ReadOutcome::Empty | ReadOutcome::Truncated => Ok(None),
                }
            },
        )
        .map(ReadOutcome::Record)
    }

    fn try_read_record(&mut self) -> LogResult<ReadOutcome> {
        let Mode::Read(state) = &mut self.mode else {
            return Err(LogError::consistency(format!(
                "segment {} is not open for read",
                self.name
            )));
        };
        let chunk = self.options.buffer_size;

        if !state.ensure_buffered(LENGTH_PREFIX, chunk, &self.path)? {
            return Ok(if state.available() == 0 {
                ReadOutcome::Empty
            } else {
                ReadOutcome::Truncated
            });
        }

        let prefix = &state.buffer[state.pos..state.pos + LENGTH_PREFIX];
        let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let len = LogRecord::check_length(
            declared,
            self.options.max_record_size,
            &self.name,
            state.offset,
        )?;

        if !state.ensure_buffered(len, chunk, &self.path)? {
            return Ok(ReadOutcome::Truncated);
        }

        let record = LogRecord::decode(
            &state.buffer[state.pos..state.pos + len],
            &self.name,
            state.offset,
            self.options.verify_checksums,
        )?;
        state.consume(len);
        Ok(ReadOutcome::Record(record))
    }

    /// Appends a record and returns whether the segment now exceeds
    /// `max_segment_size`.
    ///
    /// # Errors
    ///
    /// Returns `NotWritable` unless open for write, or a storage error.
    pub fn write_record(&mut self, record: &LogRecord, max_segment_size: u64) -> LogResult<bool> {
        let writer = self.writer()?;
        let bytes = record.encode()?;
        let length = writer.append(&bytes)?;
        Ok(length > max_segment_size)
    }

    /// Flushes written records. No-op unless open for write.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the flush fails.
    pub fn flush(&self) -> LogResult<()> {
        match &self.mode {
            Mode::Write(state) => state.writer.flush(),
            Mode::Read(_) | Mode::Closed => Ok(()),
        }
    }

    /// Truncates the segment to `length` bytes. Only used while repairing
    /// or trimming the log.
    ///
    /// # Errors
    ///
    /// Returns `NotWritable` unless open for write, or a storage error.
    pub fn set_length(&mut self, length: u64) -> LogResult<()> {
        if length < HEADER_SIZE {
            return Err(LogError::consistency(format!(
                "cannot truncate {} into its header",
                self.name
            )));
        }
        let writer = self.writer()?;
        writer.flush()?;
        writer.truncate(length)
    }

    /// Offset of the next record to read, or the append position in write
    /// mode.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the length cannot be determined.
    pub fn offset(&self) -> LogResult<u64> {
        match &self.mode {
            Mode::Read(state) => Ok(state.offset),
            Mode::Write(state) => state.writer.length(),
            Mode::Closed => Ok(0),
        }
    }

    /// Current length of the segment.
    ///
    /// # Errors
    ///
    /// Returns a storage or I/O error.
    pub fn length(&self) -> LogResult<u64> {
        match &self.mode {
            Mode::Read(state) => state
                .backend
                .size()
                .map_err(|e| LogError::storage(&self.path, 0, e)),
            Mode::Write(state) => state.writer.length(),
            Mode::Closed => Ok(fs::metadata(&self.path)?.len()),
        }
    }

    /// Returns true if the file holds nothing past its header.
    ///
    /// # Errors
    ///
    /// Returns a storage or I/O error.
    pub fn is_empty(&self) -> LogResult<bool> {
        Ok(self.length()? <= HEADER_SIZE)
    }

    /// Flushes and closes the file. Closing a closed file does nothing.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the final flush fails; the file is closed
    /// regardless.
    pub fn close(&mut self) -> LogResult<()> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Write(state) => {
                if let Some(registry) = &state.registry {
                    registry.unregister(&self.name);
                }
                state.writer.flush()
            }
            Mode::Read(_) | Mode::Closed => Ok(()),
        }
    }

    fn writer(&self) -> LogResult<&SegmentWriter> {
        match &self.mode {
            Mode::Write(state) => Ok(&state.writer),
            Mode::Read(_) | Mode::Closed => Err(LogError::not_writable(format!(
                "segment {} is not open for write",
                self.name
            ))),
        }
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(file = %self.name, error = %e, "failed to flush segment on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{encode_rotate, ChecksumKind};
    use tempfile::tempdir;

    fn record(byte: u8, len: usize) -> LogRecord {
        let mut data = vec![byte; len];
        data[0] = 1;
        LogRecord::new(data, ChecksumKind::Crc32)
    }

    #[test]
    fn file_names() {
        assert_eq!(segment_file_name(1), "log.data.0000000001");
        assert_eq!(parse_file_index("log.data.0000000042"), Some(42));
        assert_eq!(parse_file_index("log.data.42"), None);
        assert_eq!(parse_file_index("log.data.0000000000"), None);
        assert_eq!(parse_file_index("other.0000000001"), None);
        assert_eq!(parse_file_index(&segment_file_name(MAX_FILE_INDEX)), Some(MAX_FILE_INDEX));
    }

    #[test]
    fn index_wraps() {
        assert_eq!(next_file_index(1), 2);
        assert_eq!(next_file_index(MAX_FILE_INDEX), 1);
    }

    #[test]
    fn listing_is_ordered_and_filtered() {
        let dir = tempdir().unwrap();
        for name in ["log.data.0000000010", "log.data.0000000002", "disklog.lck", "notes"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(
            list_segment_files(dir.path()).unwrap(),
            vec!["log.data.0000000002", "log.data.0000000010"]
        );
    }

    #[test]
    fn header_roundtrip_and_validation() {
        let header = SegmentHeader::new(Some(17));
        let bytes = header.encode();
        assert_eq!(SegmentHeader::decode(&bytes, "f").unwrap(), header);

        let unknown = SegmentHeader::new(None).encode();
        assert_eq!(SegmentHeader::decode(&unknown, "f").unwrap().base_seqno, None);

        let mut bad_magic = bytes;
        bad_magic[0] ^= 1;
        assert!(matches!(
            SegmentHeader::decode(&bad_magic, "f"),
            Err(LogError::InvalidHeader { .. })
        ));

        let mut bad_major = bytes;
        bad_major[4] = 2;
        assert!(SegmentHeader::decode(&bad_major, "f").is_err());

        // Minor version differences are tolerated.
        let mut other_minor = bytes;
        other_minor[6] = 9;
        assert_eq!(SegmentHeader::decode(&other_minor, "f").unwrap().minor, 9);
    }

    #[test]
    fn create_fails_if_exists() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let _seg = SegmentFile::create(dir.path(), 1, Some(1), opts, None).unwrap();
        assert!(SegmentFile::create(dir.path(), 1, Some(1), opts, None).is_err());
    }

    #[test]
    fn write_then_read_records() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut seg = SegmentFile::create(dir.path(), 1, Some(1), opts, None).unwrap();
        assert!(seg.is_open_for_write());
        assert_eq!(seg.offset().unwrap(), HEADER_SIZE);

        let a = record(7, 20);
        let b = encode_rotate(2, ChecksumKind::Crc32);
        assert!(!seg.write_record(&a, 1_000).unwrap());
        assert!(!seg.write_record(&b, 1_000).unwrap());
        seg.flush().unwrap();

        let mut reader = SegmentFile::new(dir.path(), 1, opts);
        reader.open_read().unwrap();
        assert_eq!(reader.header().unwrap().base_seqno, Some(1));

        let ReadOutcome::Record(first) = reader.read_record(Duration::ZERO).unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(first.offset, HEADER_SIZE);
        assert_eq!(first.data, a.data);

        let ReadOutcome::Record(second) = reader.read_record(Duration::ZERO).unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(second.data, b.data);
        assert_eq!(reader.read_record(Duration::ZERO).unwrap(), ReadOutcome::Empty);
    }

    #[test]
    fn reports_size_bound_crossing() {
        let dir = tempdir().unwrap();
        let mut seg =
            SegmentFile::create(dir.path(), 1, Some(1), SegmentOptions::default(), None).unwrap();
        assert!(!seg.write_record(&record(1, 30), 100).unwrap());
        assert!(seg.write_record(&record(1, 60), 100).unwrap());
    }

    #[test]
    fn partial_record_is_truncated_not_error() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut seg = SegmentFile::create(dir.path(), 1, Some(1), opts, None).unwrap();
        seg.write_record(&record(3, 40), 1_000).unwrap();
        seg.flush().unwrap();
        let full = seg.length().unwrap();
        seg.set_length(full - 5).unwrap();
        drop(seg);

        let mut reader = SegmentFile::new(dir.path(), 1, opts);
        reader.open_read().unwrap();
        assert_eq!(
            reader.read_record(Duration::ZERO).unwrap(),
            ReadOutcome::Truncated
        );
        assert_eq!(reader.offset().unwrap(), HEADER_SIZE);
    }

    #[test]
    fn blocking_read_times_out() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let _writer = SegmentFile::create(dir.path(), 1, Some(1), opts, None).unwrap();

        let mut reader = SegmentFile::new(dir.path(), 1, opts);
        reader.open_read().unwrap();
        let err = reader.read_record(Duration::from_millis(30)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn tailing_reader_sees_later_writes() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut writer = SegmentFile::create(dir.path(), 1, Some(1), opts, None).unwrap();

        let mut reader = SegmentFile::new(dir.path(), 1, opts);
        reader.open_read().unwrap();
        assert_eq!(reader.read_record(Duration::ZERO).unwrap(), ReadOutcome::Empty);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.write_record(&record(9, 16), 1_000).unwrap();
            writer.flush().unwrap();
            writer
        });
        let outcome = reader.read_record(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, ReadOutcome::Record(_)));
        drop(handle.join().unwrap());
    }

    #[test]
    fn corrupt_length_is_rejected() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions {
            max_record_size: 64,
            ..SegmentOptions::default()
        };
        let mut seg = SegmentFile::create(dir.path(), 1, Some(1), opts, None).unwrap();
        seg.write_record(&record(1, 100), 1_000).unwrap();
        seg.flush().unwrap();

        let mut reader = SegmentFile::new(dir.path(), 1, opts);
        reader.open_read().unwrap();
        assert!(matches!(
            reader.read_record(Duration::ZERO),
            Err(LogError::CorruptLength { .. })
        ));
    }

    #[test]
    fn open_write_validates_header() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(segment_file_name(1)), b"garbage").unwrap();
        let mut seg = SegmentFile::new(dir.path(), 1, SegmentOptions::default());
        assert!(matches!(
            seg.open_write(None),
            Err(LogError::InvalidHeader { .. })
        ));
        assert!(!seg.is_open_for_write());
    }

    #[test]
    fn reopen_for_write_appends_at_end() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        let mut seg = SegmentFile::create(dir.path(), 1, None, opts, None).unwrap();
        seg.write_record(&record(1, 10), 1_000).unwrap();
        seg.close().unwrap();
        let length = seg.length().unwrap();

        seg.open_write(None).unwrap();
        assert_eq!(seg.offset().unwrap(), length);
        assert_eq!(seg.header().unwrap().base_seqno, None);
    }

    #[test]
    fn write_requires_write_mode() {
        let dir = tempdir().unwrap();
        let opts = SegmentOptions::default();
        drop(SegmentFile::create(dir.path(), 1, Some(1), opts, None).unwrap());
        let mut seg = SegmentFile::new(dir.path(), 1, opts);
        seg.open_read().unwrap();
        assert!(matches!(
            seg.write_record(&record(1, 10), 100),
            Err(LogError::NotWritable { .. })
        ));
        assert!(seg.set_length(HEADER_SIZE).is_err());
    }
}
