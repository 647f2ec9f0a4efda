//! Log record framing and typed record bodies.
//!
//! Every record on disk has the format:
//!
//! ```text
//! | length (4) | data (N) | checksum kind (1) | checksum (8) |
//! ```
//!
//! - `length`: total on-disk length (`N + 13`), little-endian u32
//! - `data`: record body; the first byte is the [`RecordType`]
//! - `checksum kind`: 0 = none, 1 = CRC-32 (IEEE)
//! - `checksum`: CRC-32 of `data` widened to u64, little-endian

use crate::error::{LogError, LogResult};
use crate::event::{EventHeader, ReplEvent};
use crate::serializer::EventSerializer;

/// Bytes of framing around the record data.
pub const RECORD_OVERHEAD: usize = 4 + 1 + 8;

/// Smallest valid on-disk record: framing plus a type byte.
pub const MIN_RECORD_LENGTH: usize = RECORD_OVERHEAD + 1;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Checksum strategy applied to record data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumKind {
    /// No checksum; the stored value is zero.
    None = 0,
    /// CRC-32 (IEEE polynomial).
    Crc32 = 1,
}

impl ChecksumKind {
    /// Converts a byte to a checksum kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Crc32),
            _ => None,
        }
    }

    /// Computes the checksum of `data`.
    #[must_use]
    pub fn compute(self, data: &[u8]) -> u64 {
        match self {
            Self::None => 0,
            Self::Crc32 => u64::from(crc32fast::hash(data)),
        }
    }
}

/// Type of a log record, stored as the first data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A replication event.
    Event = 1,
    /// End-of-segment marker naming the next file.
    Rotate = 2,
}

impl RecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Event),
            2 => Some(Self::Rotate),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One framed record and the offset it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Offset of the record within its segment.
    pub offset: u64,
    /// Record body.
    pub data: Vec<u8>,
    /// Checksum strategy.
    pub crc_kind: ChecksumKind,
    /// Stored checksum.
    pub crc: u64,
}

impl LogRecord {
    /// Frames `data`, computing its checksum.
    #[must_use]
    pub fn new(data: Vec<u8>, crc_kind: ChecksumKind) -> Self {
        let crc = crc_kind.compute(&data);
        Self {
            offset: 0,
            data,
            crc_kind,
            crc,
        }
    }

    /// Record type, if the first data byte names one.
    #[must_use]
    pub fn record_type(&self) -> Option<RecordType> {
        self.data.first().copied().and_then(RecordType::from_byte)
    }

    /// Total on-disk length.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.data.len() + RECORD_OVERHEAD
    }

    /// Serializes the record to its on-disk form.
    ///
    /// # Errors
    ///
    /// Returns `CorruptLength` if the record does not fit a u32 length.
    pub fn encode(&self) -> LogResult<Vec<u8>> {
        let total = u32::try_from(self.encoded_len()).map_err(|_| LogError::CorruptLength {
            file: String::new(),
            offset: self.offset,
            length: self.encoded_len() as u64,
        })?;
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf.push(self.crc_kind as u8);
        buf.extend_from_slice(&self.crc.to_le_bytes());
        Ok(buf)
    }

    /// Validates a declared record length before the body is read.
    ///
    /// # Errors
    ///
    /// Returns `CorruptLength` when the length is below the minimum record
    /// size or above `max_len`.
    pub fn check_length(length: u32, max_len: u32, file: &str, offset: u64) -> LogResult<usize> {
        let len = length as usize;
        if len < MIN_RECORD_LENGTH || length > max_len {
            return Err(LogError::CorruptLength {
                file: file.to_string(),
                offset,
                length: u64::from(length),
            });
        }
        Ok(len)
    }

    /// Parses one complete on-disk record.
    ///
    /// `bytes` must hold exactly the declared length. With `verify` set, a
    /// CRC-32 record whose stored checksum disagrees with its data fails.
    ///
    /// # Errors
    ///
    /// Returns `CorruptLength` or `ChecksumMismatch`.
    pub fn decode(bytes: &[u8], file: &str, offset: u64, verify: bool) -> LogResult<Self> {
        let corrupt_length = |length: u64| LogError::CorruptLength {
            file: file.to_string(),
            offset,
            length,
        };

        if bytes.len() < MIN_RECORD_LENGTH {
            return Err(corrupt_length(bytes.len() as u64));
        }
        let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if declared as usize != bytes.len() {
            return Err(corrupt_length(u64::from(declared)));
        }

        let data_end = bytes.len() - 9;
        let data = bytes[LENGTH_PREFIX..data_end].to_vec();
        let crc_kind = ChecksumKind::from_byte(bytes[data_end]).ok_or_else(|| {
            LogError::corrupt_record(offset, format!("unknown checksum kind {}", bytes[data_end]))
        })?;
        let mut crc_bytes = [0u8; 8];
        crc_bytes.copy_from_slice(&bytes[data_end + 1..]);
        let crc = u64::from_le_bytes(crc_bytes);

        if verify && crc_kind == ChecksumKind::Crc32 {
            let computed = crc_kind.compute(&data);
            if computed != crc {
                return Err(LogError::ChecksumMismatch {
                    file: file.to_string(),
                    offset,
                    stored: crc,
                    computed,
                });
            }
        }

        Ok(Self {
            offset,
            data,
            crc_kind,
            crc,
        })
    }
}

/// Builds an EVENT record for `event`.
///
/// # Errors
///
/// Returns a serialization error if an identifier is too long or the
/// serializer fails. A filtered range ending before its seqno is also
/// rejected.
pub fn encode_event(
    event: &ReplEvent,
    serializer: &dyn EventSerializer,
    crc_kind: ChecksumKind,
) -> LogResult<LogRecord> {
    let header = event.header();
    if header.seqno_end < header.seqno {
        return Err(LogError::serialization(format!(
            "filtered range ends at {} before seqno {}",
            header.seqno_end, header.seqno
        )));
    }
    let mut data = Vec::with_capacity(64 + event.payload.len());
    data.push(RecordType::Event.as_byte());
    data.extend_from_slice(&header.seqno.to_le_bytes());
    data.extend_from_slice(&header.fragno.to_le_bytes());
    data.push(header.flags());
    data.extend_from_slice(&header.epoch.to_le_bytes());
    data.extend_from_slice(&header.seqno_end.to_le_bytes());
    data.extend_from_slice(&header.source_tstamp.to_le_bytes());
    for value in [&header.source_id, &header.event_id, &header.shard_id] {
        let len = u16::try_from(value.len()).map_err(|_| {
            LogError::serialization(format!("identifier too long: {} bytes", value.len()))
        })?;
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(value.as_bytes());
    }
    serializer.serialize_event(event, &mut data)?;
    Ok(LogRecord::new(data, crc_kind))
}

/// Reads the fixed event header and returns it with the body offset.
///
/// # Errors
///
/// Returns `CorruptRecord` if the record is not a well-formed EVENT.
pub fn decode_event_header(record: &LogRecord) -> LogResult<(EventHeader, usize)> {
    if record.record_type() != Some(RecordType::Event) {
        return Err(LogError::corrupt_record(record.offset, "not an event record"));
    }
    let mut reader = FieldReader::new(&record.data, record.offset);
    reader.skip(1)?;
    let seqno = reader.u64()?;
    let fragno = reader.u16()?;
    let flags = reader.u8()?;
    let epoch = reader.u64()?;
    let seqno_end = reader.u64()?;
    let source_tstamp = reader.u64()?;
    let source_id = reader.string()?;
    let event_id = reader.string()?;
    let shard_id = reader.string()?;
    if seqno_end < seqno {
        return Err(LogError::corrupt_record(
            record.offset,
            format!("seqno_end {seqno_end} precedes seqno {seqno}"),
        ));
    }
    if flags & !(EventHeader::LAST_FRAG | EventHeader::FILTERED) != 0 {
        return Err(LogError::corrupt_record(
            record.offset,
            format!("unknown event flags {flags:#04x}"),
        ));
    }

    let header = EventHeader {
        seqno,
        fragno,
        last_frag: flags & EventHeader::LAST_FRAG != 0,
        filtered: flags & EventHeader::FILTERED != 0,
        epoch,
        seqno_end,
        source_tstamp,
        source_id,
        event_id,
        shard_id,
    };
    Ok((header, reader.pos))
}

/// Deserializes the full event carried by an EVENT record.
///
/// # Errors
///
/// Returns `CorruptRecord` or a serialization error.
pub fn decode_event(record: &LogRecord, serializer: &dyn EventSerializer) -> LogResult<ReplEvent> {
    let (header, body) = decode_event_header(record)?;
    let mut input = &record.data[body..];
    let decoded = serializer.deserialize_event(&mut input)?;
    Ok(ReplEvent {
        seqno: header.seqno,
        fragno: header.fragno,
        last_frag: header.last_frag,
        epoch: header.epoch,
        source_id: header.source_id,
        event_id: header.event_id,
        shard_id: header.shard_id,
        source_tstamp: header.source_tstamp,
        filtered_end: header.filtered.then_some(header.seqno_end),
        payload: decoded.payload,
    })
}

/// Builds a ROTATE record naming the next segment index.
#[must_use]
pub fn encode_rotate(next_index: u32, crc_kind: ChecksumKind) -> LogRecord {
    let mut data = Vec::with_capacity(5);
    data.push(RecordType::Rotate.as_byte());
    data.extend_from_slice(&next_index.to_le_bytes());
    LogRecord::new(data, crc_kind)
}

/// Returns the next segment index named by a ROTATE record.
///
/// # Errors
///
/// Returns `CorruptRecord` if the record is not a well-formed ROTATE.
pub fn decode_rotate(record: &LogRecord) -> LogResult<u32> {
    if record.record_type() != Some(RecordType::Rotate) || record.data.len() != 5 {
        return Err(LogError::corrupt_record(record.offset, "malformed rotate record"));
    }
    let mut reader = FieldReader::new(&record.data, record.offset);
    reader.skip(1)?;
    reader.u32()
}

/// Little-endian field reader over record data.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    offset: u64,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8], offset: u64) -> Self {
        Self {
            data,
            pos: 0,
            offset,
        }
    }

    fn take(&mut self, n: usize) -> LogResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(LogError::corrupt_record(
                self.offset,
                "unexpected end of record data",
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> LogResult<()> {
        self.take(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> LogResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> LogResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> LogResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> LogResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> LogResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn string(&mut self) -> LogResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| LogError::corrupt_record(self.offset, "identifier is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{BinarySerializer, CborSerializer};
    use proptest::prelude::*;

    fn event() -> ReplEvent {
        ReplEvent::new(5, b"insert into t values (1)".to_vec())
            .with_fragment(0, true)
            .with_epoch(2)
            .with_ids("src-a", "pos-17", "shard-1")
    }

    #[test]
    fn record_encode_decode() {
        let record = LogRecord::new(vec![2, 1, 0, 0, 0], ChecksumKind::Crc32);
        let bytes = record.encode().unwrap();
        assert_eq!(bytes.len(), 5 + RECORD_OVERHEAD);
        assert_eq!(&bytes[..4], &(18u32).to_le_bytes());

        let decoded = LogRecord::decode(&bytes, "f", 0, true).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn checksum_mismatch_detected() {
        let record = encode_event(&event(), &BinarySerializer, ChecksumKind::Crc32).unwrap();
        let mut bytes = record.encode().unwrap();
        bytes[10] ^= 0xFF;

        let err = LogRecord::decode(&bytes, "log.data.0000000001", 16, true).unwrap_err();
        assert!(matches!(err, LogError::ChecksumMismatch { offset: 16, .. }));

        // Verification disabled accepts the damaged record.
        assert!(LogRecord::decode(&bytes, "f", 16, false).is_ok());
    }

    #[test]
    fn unchecked_records_skip_verification() {
        let record = LogRecord::new(vec![1, 2, 3], ChecksumKind::None);
        assert_eq!(record.crc, 0);
        let mut bytes = record.encode().unwrap();
        bytes[5] ^= 0xFF;
        assert!(LogRecord::decode(&bytes, "f", 0, true).is_ok());
    }

    #[test]
    fn length_bounds() {
        assert!(LogRecord::check_length(13, 1024, "f", 0).is_err());
        assert_eq!(LogRecord::check_length(14, 1024, "f", 0).unwrap(), 14);
        assert!(matches!(
            LogRecord::check_length(2048, 1024, "f", 99),
            Err(LogError::CorruptLength {
                offset: 99,
                length: 2048,
                ..
            })
        ));
    }

    #[test]
    fn declared_length_must_match() {
        let mut bytes = LogRecord::new(vec![2, 0, 0, 0, 0], ChecksumKind::None)
            .encode()
            .unwrap();
        bytes[0] = 40;
        assert!(matches!(
            LogRecord::decode(&bytes, "f", 0, true),
            Err(LogError::CorruptLength { length: 40, .. })
        ));
    }

    #[test]
    fn event_record_header_and_body() {
        let original = event();
        for serializer in [
            &BinarySerializer as &dyn EventSerializer,
            &CborSerializer as &dyn EventSerializer,
        ] {
            let record = encode_event(&original, serializer, ChecksumKind::Crc32).unwrap();
            assert_eq!(record.record_type(), Some(RecordType::Event));

            let (header, _) = decode_event_header(&record).unwrap();
            assert_eq!(header, original.header());
            assert_eq!(decode_event(&record, serializer).unwrap(), original);
        }
    }

    #[test]
    fn filtered_event_header_carries_range() {
        let gap = ReplEvent::filtered(10, 20);
        let record = encode_event(&gap, &BinarySerializer, ChecksumKind::None).unwrap();
        let (header, _) = decode_event_header(&record).unwrap();
        assert_eq!(header.seqno, 10);
        assert_eq!(header.seqno_end, 20);
        assert!(header.covers(15));
        assert_eq!(decode_event(&record, &BinarySerializer).unwrap(), gap);
    }

    #[test]
    fn single_seqno_filtered_event_stays_filtered() {
        let gap = ReplEvent::filtered(5, 5);
        let record = encode_event(&gap, &CborSerializer, ChecksumKind::Crc32).unwrap();
        let (header, _) = decode_event_header(&record).unwrap();
        assert!(header.is_filtered());
        assert_eq!(header.seqno_end, 5);

        let decoded = decode_event(&record, &CborSerializer).unwrap();
        assert!(decoded.is_filtered());
        assert_eq!(decoded, gap);
    }

    #[test]
    fn identifiers_are_stored_once() {
        let original = event();
        let record = encode_event(&original, &BinarySerializer, ChecksumKind::None).unwrap();
        let (_, body) = decode_event_header(&record).unwrap();
        assert_eq!(record.data.len() - body, 4 + original.payload.len());

        let needle = original.event_id.as_bytes();
        let hits = record
            .data
            .windows(needle.len())
            .filter(|w| *w == needle)
            .count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn inverted_filtered_range_is_rejected() {
        let mut gap = ReplEvent::filtered(9, 9);
        gap.filtered_end = Some(3);
        assert!(matches!(
            encode_event(&gap, &BinarySerializer, ChecksumKind::None),
            Err(LogError::Serialization { .. })
        ));
    }

    #[test]
    fn unknown_event_flags_are_corrupt() {
        let mut record = encode_event(&event(), &BinarySerializer, ChecksumKind::None).unwrap();
        // Type byte, seqno and fragno precede the flags.
        record.data[1 + 8 + 2] |= 0x80;
        assert!(matches!(
            decode_event_header(&record),
            Err(LogError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn rotate_record() {
        let record = encode_rotate(7, ChecksumKind::Crc32);
        assert_eq!(record.record_type(), Some(RecordType::Rotate));
        assert_eq!(decode_rotate(&record).unwrap(), 7);
        assert!(decode_event_header(&record).is_err());

        let event = encode_event(&event(), &BinarySerializer, ChecksumKind::None).unwrap();
        assert!(decode_rotate(&event).is_err());
    }

    #[test]
    fn truncated_event_header_is_corrupt() {
        let mut record = encode_event(&event(), &BinarySerializer, ChecksumKind::None).unwrap();
        record.data.truncate(12);
        assert!(matches!(
            decode_event_header(&record),
            Err(LogError::CorruptRecord { .. })
        ));
    }

    proptest! {
        #[test]
        fn any_single_bit_flip_in_data_is_detected(
            payload in prop::collection::vec(any::<u8>(), 0..256),
            bit in 0usize..64,
        ) {
            let original = ReplEvent::new(1, payload);
            let record = encode_event(&original, &BinarySerializer, ChecksumKind::Crc32).unwrap();
            let mut bytes = record.encode().unwrap();
            let data_len = record.data.len();
            let idx = LENGTH_PREFIX + (bit / 8) % data_len;
            bytes[idx] ^= 1 << (bit % 8);
            let decoded = LogRecord::decode(&bytes, "f", 0, true);
            prop_assert!(
                matches!(decoded, Err(LogError::ChecksumMismatch { .. })),
                "expected checksum mismatch",
            );
        }
    }
}
