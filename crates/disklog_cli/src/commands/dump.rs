//! Dump command implementation.

use super::open_log;
use disklog_core::{LogConnection, ReplEvent};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

/// Event representation for output.
#[derive(Debug, Serialize)]
pub struct EventInfo {
    /// Sequence number.
    pub seqno: u64,
    /// Fragment number.
    pub fragno: u16,
    /// Last fragment of its transaction.
    pub last_frag: bool,
    /// Writer epoch.
    pub epoch: u64,
    /// Last seqno covered by a filtered event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered_end: Option<u64>,
    /// Source identifier.
    pub source_id: String,
    /// Event identifier.
    pub event_id: String,
    /// Shard identifier.
    pub shard_id: String,
    /// Source timestamp in milliseconds.
    pub source_tstamp: u64,
    /// Payload size in bytes.
    pub payload_size: usize,
}

impl From<&ReplEvent> for EventInfo {
    fn from(event: &ReplEvent) -> Self {
        Self {
            seqno: event.seqno,
            fragno: event.fragno,
            last_frag: event.last_frag,
            epoch: event.epoch,
            filtered_end: event.filtered_end,
            source_id: event.source_id.clone(),
            event_id: event.event_id.clone(),
            shard_id: event.shard_id.clone(),
            source_tstamp: event.source_tstamp,
            payload_size: event.payload.len(),
        }
    }
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    from: Option<u64>,
    limit: Option<usize>,
    follow: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let log = open_log(path, false)?;
    let start = from.or_else(|| log.min_seqno()).unwrap_or(0);
    info!("Dumping events from seqno {} of {:?}", start, path);

    let mut reader = log.connect(true)?;
    if !reader.seek(start, 0)? {
        return Err(format!("Seqno {start} is not in the log").into());
    }

    let max_events = limit.unwrap_or(usize::MAX);
    let mut printed = 0;
    while printed < max_events {
        let Some(event) = next_event(&mut reader, follow)? else {
            break;
        };
        let info = EventInfo::from(&event);
        match format {
            "json" => println!("{}", serde_json::to_string(&info)?),
            _ => println!("{event}"),
        }
        printed += 1;
    }

    reader.release()?;
    Ok(())
}

/// Reads the next event; in follow mode read timeouts are retried.
fn next_event(
    reader: &mut LogConnection,
    follow: bool,
) -> Result<Option<ReplEvent>, Box<dyn std::error::Error>> {
    if !follow {
        return Ok(reader.next(false)?);
    }
    loop {
        match reader.next(true) {
            Ok(event) => return Ok(event),
            Err(e) if e.is_timeout() => {
                debug!("No new events yet; still following");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_info_summarises_payload() {
        let event = ReplEvent::filtered(10, 20);
        let info = EventInfo::from(&event);
        assert_eq!(info.filtered_end, Some(20));
        assert_eq!(info.payload_size, 0);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["seqno"], 10);
        assert_eq!(json["filtered_end"], 20);
    }
}
