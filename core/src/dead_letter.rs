//! Dead-letter records.
//!
//! When an entry exhausts its retries it is copied, together with the error
//! that killed it, into a separate dead-letter stream. The original stream is
//! never modified. A record carries everything needed to replay or inspect the
//! failure later.
//!
//! # Fields
//!
//! | field             | content                                              |
//! |-------------------|------------------------------------------------------|
//! | `original_stream` | stream the entry was read from                       |
//! | `original_id`     | id of the entry in that stream                       |
//! | `error`           | message of the last processing failure               |
//! | `timestamp`       | when the entry was dead-lettered (RFC 3339)          |
//! | `event`           | the original serialized event (empty if absent)      |
//! | `event_type`      | best-effort type, `unknown` if it could not be read  |
//! | `consumer`        | consumer that gave up on the entry                   |
//! | `delivery_count`  | deliveries made before giving up                     |
//! | `field.<name>`    | every other field of the original entry, verbatim    |

use crate::entry::{EntryId, StreamEntry};
use crate::envelope::{EVENT_FIELD, best_effort_type};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

const ORIGINAL_STREAM: &str = "original_stream";
const ORIGINAL_ID: &str = "original_id";
const ERROR: &str = "error";
const TIMESTAMP: &str = "timestamp";
const EVENT: &str = "event";
const EVENT_TYPE: &str = "event_type";
const CONSUMER: &str = "consumer";
const DELIVERY_COUNT: &str = "delivery_count";
const EXTRA_FIELD_PREFIX: &str = "field.";

/// Error returned when a dead-letter entry cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterDecodeError {
    /// A required field is missing
    #[error("Dead-letter entry is missing field '{0}'")]
    MissingField(&'static str),

    /// A field could not be parsed
    #[error("Dead-letter entry has invalid '{field}': {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Raw value
        value: String,
    },
}

/// A failed entry copied into the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Stream the entry was read from
    pub original_stream: String,
    /// Id of the entry in the original stream
    pub original_id: EntryId,
    /// Message of the last processing failure
    pub error: String,
    /// When the entry was dead-lettered
    pub failed_at: DateTime<Utc>,
    /// Best-effort event type
    pub event_type: String,
    /// Consumer that moved the entry
    pub consumer: String,
    /// Deliveries made before giving up
    pub delivery_count: u64,
    /// All fields of the original entry
    pub original_fields: BTreeMap<String, String>,
}

impl DeadLetterRecord {
    /// Build a record for `entry` read from `stream`.
    #[must_use]
    pub fn from_entry(
        stream: &str,
        entry: &StreamEntry,
        error: impl Into<String>,
        failed_at: DateTime<Utc>,
        consumer: &str,
        delivery_count: u64,
    ) -> Self {
        Self {
            original_stream: stream.to_string(),
            original_id: entry.id,
            error: error.into(),
            failed_at,
            event_type: best_effort_type(entry),
            consumer: consumer.to_string(),
            delivery_count,
            original_fields: entry.fields.clone(),
        }
    }

    /// The original serialized event, if the entry carried one.
    #[must_use]
    pub fn event(&self) -> Option<&str> {
        self.original_fields.get(EVENT_FIELD).map(String::as_str)
    }

    /// Encode as the field set appended to the dead-letter stream.
    #[must_use]
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::from([
            (ORIGINAL_STREAM.to_string(), self.original_stream.clone()),
            (ORIGINAL_ID.to_string(), self.original_id.to_string()),
            (ERROR.to_string(), self.error.clone()),
            (
                TIMESTAMP.to_string(),
                self.failed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (EVENT.to_string(), self.event().unwrap_or_default().to_string()),
            (EVENT_TYPE.to_string(), self.event_type.clone()),
            (CONSUMER.to_string(), self.consumer.clone()),
            (DELIVERY_COUNT.to_string(), self.delivery_count.to_string()),
        ]);
        for (name, value) in &self.original_fields {
            if name != EVENT_FIELD {
                fields.insert(format!("{EXTRA_FIELD_PREFIX}{name}"), value.clone());
            }
        }
        fields
    }

    /// Decode a record read back from the dead-letter stream.
    ///
    /// # Errors
    ///
    /// Returns a [`DeadLetterDecodeError`] if a required field is missing or
    /// the id, timestamp or delivery count cannot be parsed.
    pub fn from_dead_letter_entry(entry: &StreamEntry) -> Result<Self, DeadLetterDecodeError> {
        let get = |name: &'static str| {
            entry
                .field(name)
                .ok_or(DeadLetterDecodeError::MissingField(name))
        };
        let invalid = |field: &'static str, value: &str| DeadLetterDecodeError::InvalidField {
            field,
            value: value.to_string(),
        };

        let original_id_raw = get(ORIGINAL_ID)?;
        let original_id = original_id_raw
            .parse()
            .map_err(|_| invalid(ORIGINAL_ID, original_id_raw))?;
        let timestamp_raw = get(TIMESTAMP)?;
        let failed_at = DateTime::parse_from_rfc3339(timestamp_raw)
            .map_err(|_| invalid(TIMESTAMP, timestamp_raw))?
            .with_timezone(&Utc);
        let delivery_count = match entry.field(DELIVERY_COUNT) {
            Some(raw) => raw.parse().map_err(|_| invalid(DELIVERY_COUNT, raw))?,
            None => 0,
        };

        let mut original_fields: BTreeMap<String, String> = entry
            .fields
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(EXTRA_FIELD_PREFIX)
                    .map(|original| (original.to_string(), value.clone()))
            })
            .collect();
        if let Some(event) = entry.field(EVENT).filter(|e| !e.is_empty()) {
            original_fields.insert(EVENT_FIELD.to_string(), event.to_string());
        }

        Ok(Self {
            original_stream: get(ORIGINAL_STREAM)?.to_string(),
            original_id,
            error: get(ERROR)?.to_string(),
            failed_at,
            event_type: entry.field(EVENT_TYPE).unwrap_or("unknown").to_string(),
            consumer: entry.field(CONSUMER).unwrap_or_default().to_string(),
            delivery_count,
            original_fields,
        })
    }
}
