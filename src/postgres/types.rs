use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;

/// Event time as stored. `timestamp` columns come back naive and are
/// localized later; `timestamptz` columns are already absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventTime {
    Naive(NaiveDateTime),
    Utc(DateTime<Utc>),
}

/// Store-side identity used to address a row in mark-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Timestamp(EventTime),
    Id(i64),
}

/// One telemetry row pending delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    pub timestamp: EventTime,
    pub fields: Map<String, Value>,
}

impl Record {
    /// A record addressed by its own event timestamp.
    pub fn new(timestamp: EventTime, fields: Map<String, Value>) -> Self {
        Self {
            key: RecordKey::Timestamp(timestamp),
            timestamp,
            fields,
        }
    }

    pub fn with_id(id: i64, timestamp: EventTime, fields: Map<String, Value>) -> Self {
        Self {
            key: RecordKey::Id(id),
            timestamp,
            fields,
        }
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTime::Naive(ts) => write!(f, "{}", ts),
            EventTime::Utc(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Timestamp(ts) => write!(f, "timestamp={}", ts),
            RecordKey::Id(id) => write!(f, "id={}", id),
        }
    }
}
