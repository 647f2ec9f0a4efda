//! Event serializer strategies.
//!
//! The log treats serialized events as opaque bytes. A serializer is chosen
//! by name in [`LogConfig::serializer`](crate::LogConfig) and resolved once
//! when the log is prepared.
//!
//! | Name | Format |
//! |------|--------|
//! | `binary` | `u32` length-prefixed payload |
//! | `cbor` | CBOR byte string via `ciborium` |

use crate::error::{LogError, LogResult};
use crate::event::ReplEvent;
use ciborium::value::Value;
use std::io::{Read, Write};
use std::sync::Arc;

/// Serializer used when none is configured.
pub const DEFAULT_SERIALIZER: &str = BinarySerializer::NAME;

/// Converts event bodies to and from the opaque bytes stored in the log.
///
/// The record codec writes the fixed event header (seqno, fragment,
/// epoch, range, identifiers) itself. A serializer only carries what the
/// header does not, and [`decode_event`](crate::record::decode_event) fills
/// the header fields back into the event it returns.
pub trait EventSerializer: Send + Sync {
    /// Name under which the serializer is registered.
    fn name(&self) -> &'static str;

    /// Writes the body of `event` to `output`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the event cannot be written.
    fn serialize_event(&self, event: &ReplEvent, output: &mut dyn Write) -> LogResult<()>;

    /// Reads one event body from `input`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the bytes are not a valid body.
    fn deserialize_event(&self, input: &mut dyn Read) -> LogResult<ReplEvent>;
}

/// Returns true if `name` resolves to a serializer.
#[must_use]
pub fn is_known(name: &str) -> bool {
    matches!(name, BinarySerializer::NAME | CborSerializer::NAME)
}

/// Resolves a serializer by name.
///
/// # Errors
///
/// Returns `InvalidConfig` for an unknown name.
pub fn serializer_by_name(name: &str) -> LogResult<Arc<dyn EventSerializer>> {
    match name {
        BinarySerializer::NAME => Ok(Arc::new(BinarySerializer)),
        CborSerializer::NAME => Ok(Arc::new(CborSerializer)),
        other => Err(LogError::invalid_config(format!(
            "unknown serializer: {other}"
        ))),
    }
}

/// Length-prefixed payload.
///
/// ```text
/// | payload length u32 | payload |
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct BinarySerializer;

impl BinarySerializer {
    /// Registered name.
    pub const NAME: &'static str = "binary";
}

impl EventSerializer for BinarySerializer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn serialize_event(&self, event: &ReplEvent, output: &mut dyn Write) -> LogResult<()> {
        let len = u32::try_from(event.payload.len()).map_err(|_| {
            LogError::serialization(format!("payload too large: {} bytes", event.payload.len()))
        })?;
        output.write_all(&len.to_le_bytes()).map_err(ser_io)?;
        output.write_all(&event.payload).map_err(ser_io)
    }

    fn deserialize_event(&self, input: &mut dyn Read) -> LogResult<ReplEvent> {
        let len = u32::from_le_bytes(read_array(input)?) as usize;
        let mut payload = vec![0u8; len];
        input.read_exact(&mut payload).map_err(ser_io)?;
        Ok(ReplEvent::new(0, payload))
    }
}

/// Payload as a CBOR byte string.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborSerializer;

impl CborSerializer {
    /// Registered name.
    pub const NAME: &'static str = "cbor";
}

impl EventSerializer for CborSerializer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn serialize_event(&self, event: &ReplEvent, output: &mut dyn Write) -> LogResult<()> {
        let body = Value::Bytes(event.payload.clone());
        ciborium::into_writer(&body, output).map_err(|e| LogError::serialization(e.to_string()))
    }

    fn deserialize_event(&self, input: &mut dyn Read) -> LogResult<ReplEvent> {
        let body: Value =
            ciborium::from_reader(input).map_err(|e| LogError::serialization(e.to_string()))?;
        match body {
            Value::Bytes(payload) => Ok(ReplEvent::new(0, payload)),
            _ => Err(LogError::serialization("event body is not a byte string")),
        }
    }
}

fn ser_io(e: std::io::Error) -> LogError {
    LogError::serialization(e.to_string())
}

fn read_array<const N: usize>(input: &mut dyn Read) -> LogResult<[u8; N]> {
    let mut bytes = [0u8; N];
    input.read_exact(&mut bytes).map_err(ser_io)?;
    Ok(bytes)
}
