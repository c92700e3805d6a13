//! Composite storage identity of an event.
//!
//! Stored events are addressed by four components:
//! - partition key: event instant truncated to the UTC hour
//! - row key: event instant truncated to the millisecond
//! - sensor id
//! - content hash: CRC32C of the canonical event encoding, hex encoded
//!
//! Both bucket values are epoch milliseconds. [`row_key`] is the single
//! rounding rule shared by the write path and range lookups, so a range
//! bound always lands in the same bucket as an event carrying that instant.

use crate::event::Event;
use chrono::{DateTime, Utc};
use tonic::Status;

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Fine time bucket of an instant.
pub fn row_key(instant: &DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Coarse time bucket of an instant.
pub fn partition_key(instant: &DateTime<Utc>) -> i64 {
    let millis = row_key(instant);
    millis - millis.rem_euclid(MILLIS_PER_HOUR)
}

/// Hex encoded CRC32C of an encoded event.
pub fn content_hash(encoded: &str) -> String {
    hex::encode(crc32c::crc32c(encoded.as_bytes()).to_be_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub partition_key: i64,
    pub row_key: i64,
    pub sid: String,
    pub event_hash: String,
}

/// An event ready to be written: its identity plus the canonical encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: EntryKey,
    pub json: String,
}

impl CacheEntry {
    /// Derives the storage identity of an event.
    ///
    /// Fails when the event timestamp cannot be parsed into an instant.
    pub fn from_event(event: &Event) -> Result<Self, Status> {
        let instant = event.instant().ok_or_else(|| {
            Status::invalid_argument(format!(
                "event for sid {} has unparsable timestamp {}",
                event.sid(),
                event.timestamp_value()
            ))
        })?;
        let json = event.encode();
        Ok(Self {
            key: EntryKey {
                partition_key: partition_key(&instant),
                row_key: row_key(&instant),
                sid: event.sid().to_string(),
                event_hash: content_hash(&json),
            },
            json,
        })
    }
}
