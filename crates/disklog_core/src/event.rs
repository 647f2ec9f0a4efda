//! Replication events stored in the log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of replicated work appended to the log.
///
/// Large transactions are split into fragments sharing one `seqno`; the
/// fragment with `last_frag` set closes the transaction. A filtered (gap)
/// event stands in for the contiguous range `[seqno, filtered_end]` that was
/// intentionally skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplEvent {
    /// Sequence number, the primary ordering key.
    pub seqno: u64,
    /// Fragment index within the transaction.
    pub fragno: u16,
    /// Whether this fragment closes the transaction.
    pub last_frag: bool,
    /// Generation counter of the writer.
    pub epoch: u64,
    /// Originating source.
    pub source_id: String,
    /// Source-specific position of the event.
    pub event_id: String,
    /// Shard the event belongs to.
    pub shard_id: String,
    /// Source commit time in milliseconds since the Unix epoch.
    pub source_tstamp: u64,
    /// Last seqno covered by a filtered event.
    pub filtered_end: Option<u64>,
    /// Opaque event body.
    pub payload: Vec<u8>,
}

impl ReplEvent {
    /// Creates a single-fragment event.
    #[must_use]
    pub fn new(seqno: u64, payload: Vec<u8>) -> Self {
        Self {
            seqno,
            fragno: 0,
            last_frag: true,
            epoch: 0,
            source_id: String::new(),
            event_id: String::new(),
            shard_id: String::new(),
            source_tstamp: 0,
            filtered_end: None,
            payload,
        }
    }

    /// Creates a filtered event covering `[seqno, seqno_end]`.
    #[must_use]
    pub fn filtered(seqno: u64, seqno_end: u64) -> Self {
        Self {
            filtered_end: Some(seqno_end.max(seqno)),
            ..Self::new(seqno, Vec::new())
        }
    }

    /// Sets fragment number and last-fragment flag.
    #[must_use]
    pub fn with_fragment(mut self, fragno: u16, last_frag: bool) -> Self {
        self.fragno = fragno;
        self.last_frag = last_frag;
        self
    }

    /// Sets the epoch.
    #[must_use]
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Sets source, event and shard identifiers.
    #[must_use]
    pub fn with_ids(
        mut self,
        source_id: impl Into<String>,
        event_id: impl Into<String>,
        shard_id: impl Into<String>,
    ) -> Self {
        self.source_id = source_id.into();
        self.event_id = event_id.into();
        self.shard_id = shard_id.into();
        self
    }

    /// Sets the source timestamp.
    #[must_use]
    pub fn with_source_tstamp(mut self, millis: u64) -> Self {
        self.source_tstamp = millis;
        self
    }

    /// Returns true for a filtered (gap) event.
    #[must_use]
    pub fn is_filtered(&self) -> bool {
        self.filtered_end.is_some()
    }

    /// Last seqno this event accounts for.
    #[must_use]
    pub fn seqno_end(&self) -> u64 {
        self.filtered_end.unwrap_or(self.seqno)
    }

    /// Header fields written ahead of the serialized body.
    #[must_use]
    pub fn header(&self) -> EventHeader {
        EventHeader {
            seqno: self.seqno,
            fragno: self.fragno,
            last_frag: self.last_frag,
            filtered: self.is_filtered(),
            epoch: self.epoch,
            seqno_end: self.seqno_end(),
            source_tstamp: self.source_tstamp,
            source_id: self.source_id.clone(),
            event_id: self.event_id.clone(),
            shard_id: self.shard_id.clone(),
        }
    }
}

impl fmt::Display for ReplEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seqno={} fragno={}", self.seqno, self.fragno)?;
        if self.last_frag {
            write!(f, " last")?;
        }
        if let Some(end) = self.filtered_end {
            write!(f, " filtered..{end}")?;
        }
        write!(f, " epoch={} bytes={}", self.epoch, self.payload.len())
    }
}

/// Fixed event fields readable without deserializing the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    /// Sequence number.
    pub seqno: u64,
    /// Fragment number.
    pub fragno: u16,
    /// Last-fragment flag.
    pub last_frag: bool,
    /// Set for a filtered (gap) event.
    pub filtered: bool,
    /// Epoch.
    pub epoch: u64,
    /// Last seqno covered (equals `seqno` unless filtered).
    pub seqno_end: u64,
    /// Source timestamp in milliseconds.
    pub source_tstamp: u64,
    /// Source identifier.
    pub source_id: String,
    /// Event identifier.
    pub event_id: String,
    /// Shard identifier.
    pub shard_id: String,
}

impl EventHeader {
    /// Flag bit for `last_frag` in the stored flags byte.
    pub const LAST_FRAG: u8 = 0x01;
    /// Flag bit for a filtered event in the stored flags byte.
    pub const FILTERED: u8 = 0x02;

    /// Returns true for a filtered event.
    #[must_use]
    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// Flags byte written to the record.
    #[must_use]
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.last_frag {
            flags |= Self::LAST_FRAG;
        }
        if self.filtered {
            flags |= Self::FILTERED;
        }
        flags
    }

    /// Returns true if `seqno` falls within `[seqno, seqno_end]`.
    #[must_use]
    pub fn covers(&self, seqno: u64) -> bool {
        self.seqno <= seqno && seqno <= self.seqno_end
    }
}
