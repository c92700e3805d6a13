//! Sensor event model.
//!
//! An event is a flat JSON object carrying at least a sensor identifier
//! (`SID`, a string) and an ISO-8601 `timestamp`. Every other field is
//! opaque payload and travels through the system untouched.
//!
//! ```rust
//! use eventcache_core::event::Event;
//! use serde_json::json;
//!
//! let event = Event::try_from(json!({
//!     "SID": "sensor-17",
//!     "timestamp": "2024-03-01T12:00:00.250Z",
//!     "temperature": 21.5
//! })).unwrap();
//! assert_eq!(event.sid(), "sensor-17");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field holding the sensor identifier.
pub const SID_FIELD: &str = "SID";
/// Field holding the event instant.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Reasons an incoming value is refused before it reaches a queue or a cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventRejection {
    #[error("event is not a JSON object")]
    NotAnObject,
    #[error("event has no SID field")]
    MissingSid,
    #[error("event SID is not a string")]
    SidNotString,
    #[error("event has no timestamp field")]
    MissingTimestamp,
}

/// A validated sensor event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    /// Sensor identifier of this event.
    pub fn sid(&self) -> &str {
        self.0
            .get(SID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Raw timestamp value as carried by the producer.
    pub fn timestamp_value(&self) -> &Value {
        self.0.get(TIMESTAMP_FIELD).unwrap_or(&Value::Null)
    }

    /// Parses the timestamp into a UTC instant.
    ///
    /// Returns `None` when the timestamp is not an RFC 3339 string. Such
    /// events pass intake validation but cannot be keyed for storage.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.timestamp_value()
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Canonical JSON encoding; object keys are emitted in sorted order at
    /// every nesting level.
    pub fn encode(&self) -> String {
        canonical(&Value::Object(self.0.clone())).to_string()
    }

    /// Decodes an event previously produced by [`Event::encode`].
    pub fn decode(json: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(json)?;
        Self::try_from(value).map_err(serde::de::Error::custom)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for Event {
    type Error = EventRejection;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err(EventRejection::NotAnObject);
        };
        match fields.get(SID_FIELD) {
            None => return Err(EventRejection::MissingSid),
            Some(Value::String(_)) => {}
            Some(_) => return Err(EventRejection::SidNotString),
        }
        if !fields.contains_key(TIMESTAMP_FIELD) {
            return Err(EventRejection::MissingTimestamp);
        }
        Ok(Self(fields))
    }
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut sorted: Vec<_> = fields.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonical(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
