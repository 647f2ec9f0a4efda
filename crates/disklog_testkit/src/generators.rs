//! Property-based test generators using proptest.
//!
//! Provides strategies for generating events and event streams that keep
//! the log's ordering rules.

use disklog_core::ReplEvent;
use proptest::prelude::*;

/// Strategy for event payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for source, event and shard identifiers.
pub fn identifier_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9._:-]{0,24}").expect("Invalid regex")
}

/// Strategy for one complete event with arbitrary metadata at `seqno`.
pub fn event_strategy(seqno: u64) -> impl Strategy<Value = ReplEvent> {
    (
        payload_strategy(),
        any::<u64>(),
        identifier_strategy(),
        identifier_strategy(),
        identifier_strategy(),
        any::<u64>(),
    )
        .prop_map(move |(payload, epoch, source, event_id, shard, tstamp)| {
            ReplEvent::new(seqno, payload)
                .with_epoch(epoch)
                .with_ids(source, event_id, shard)
                .with_source_tstamp(tstamp)
        })
}

/// Shape of one transaction in a generated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxShape {
    /// One event.
    Single,
    /// A transaction split into this many fragments.
    Fragmented(u16),
    /// A filtered event covering this many seqnos.
    Filtered(u64),
}

fn tx_shape_strategy() -> impl Strategy<Value = TxShape> {
    prop_oneof![
        6 => Just(TxShape::Single),
        2 => (2u16..5).prop_map(TxShape::Fragmented),
        1 => (1u64..10).prop_map(TxShape::Filtered),
    ]
}

/// Strategy for a valid event stream starting at `first_seqno`, with
/// seqno gaps, fragmented transactions and filtered events.
pub fn event_stream_strategy(
    first_seqno: u64,
    max_transactions: usize,
) -> impl Strategy<Value = Vec<ReplEvent>> {
    prop::collection::vec(
        (tx_shape_strategy(), 0u64..3, prop::collection::vec(any::<u8>(), 0..200)),
        1..=max_transactions,
    )
    .prop_map(move |txs| {
        let mut events = Vec::new();
        let mut seqno = first_seqno;
        for (shape, gap, payload) in txs {
            seqno += gap;
            match shape {
                TxShape::Single => {
                    events.push(ReplEvent::new(seqno, payload));
                    seqno += 1;
                }
                TxShape::Fragmented(count) => {
                    for fragno in 0..count {
                        events.push(
                            ReplEvent::new(seqno, payload.clone())
                                .with_fragment(fragno, fragno + 1 == count),
                        );
                    }
                    seqno += 1;
                }
                TxShape::Filtered(width) => {
                    events.push(ReplEvent::filtered(seqno, seqno + width));
                    seqno += width + 1;
                }
            }
        }
        events
    })
}

/// Highest seqno covered by a stream, as a log records it.
pub fn stream_max_seqno(events: &[ReplEvent]) -> Option<u64> {
    events
        .iter()
        .filter(|e| e.last_frag)
        .map(ReplEvent::seqno_end)
        .max()
}
