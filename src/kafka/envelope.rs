use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::postgres::{EventTime, Record};
use crate::{Error, Result};

/// The wire-level unit published for one record.
///
/// `message_id` is the Kafka key and the consumer-side dedup key. Measurement
/// fields are flattened next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Turns records into envelopes: fresh identifier, copied fields, UTC time.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeBuilder {
    source_tz: Tz,
}

impl Default for EnvelopeBuilder {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl EnvelopeBuilder {
    pub fn new(source_tz: Tz) -> Self {
        Self { source_tz }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Ok(Self::new(config.source_tz()?))
    }

    pub fn build(&self, record: &Record) -> Result<Envelope> {
        Ok(Envelope {
            message_id: Uuid::new_v4().to_string(),
            fields: record.fields.clone(),
            timestamp: self.normalize(record.timestamp)?,
        })
    }

    /// Naive times are read in the source zone. A local time skipped by a DST
    /// transition is rejected; one repeated by it resolves to the earlier instant.
    pub fn normalize(&self, time: EventTime) -> Result<DateTime<Utc>> {
        match time {
            EventTime::Utc(ts) => Ok(ts),
            EventTime::Naive(ts) => self
                .source_tz
                .from_local_datetime(&ts)
                .earliest()
                .map(|local| local.with_timezone(&Utc))
                .ok_or_else(|| Error::Validation {
                    message: format!("{} does not exist in time zone {}", ts, self.source_tz),
                }),
        }
    }
}
