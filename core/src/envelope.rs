//! Event envelopes: the decoded, validated form of a raw stream entry.
//!
//! Publishers append entries whose `event` field holds a JSON document:
//!
//! ```json
//! {
//!   "id": "evt-7f3c",
//!   "type": "task.assigned",
//!   "correlation_id": "req-1029",
//!   "payload": { "task_id": 88, "assignee": "ops" },
//!   "timestamp": "2025-01-01T00:00:00Z"
//! }
//! ```
//!
//! An entry may also carry a top-level `type` field so the type can be read
//! without parsing the document. [`EventEnvelope::decode`] enforces the
//! structural contract; anything that fails it is reported as an
//! [`EnvelopeError`] and handled like any other processing failure.

use crate::entry::StreamEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Entry field holding the serialized envelope.
pub const EVENT_FIELD: &str = "event";

/// Optional entry field duplicating the envelope's `type`.
pub const TYPE_FIELD: &str = "type";

/// Label used when an entry's type cannot be determined.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Reasons an entry cannot be turned into an [`EventEnvelope`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The entry has no `event` field
    #[error("Entry has no 'event' field")]
    MissingEventField,

    /// The `event` field is not valid JSON (or not an object)
    #[error("Malformed event JSON: {0}")]
    MalformedJson(String),

    /// A required envelope field is missing or empty
    #[error("Envelope is missing required field '{0}'")]
    MissingField(&'static str),

    /// The envelope's `type` is not a known event kind
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A timestamp could not be parsed as RFC 3339
    #[error("Invalid timestamp '{value}' in field '{field}'")]
    InvalidTimestamp {
        /// Field name
        field: &'static str,
        /// Raw value
        value: String,
    },
}

/// The kinds of domain events published by the surrounding application.
///
/// Dispatch is keyed on this enum rather than on raw strings, so adding a kind
/// forces every exhaustive `match` over it to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// A new request was submitted for approval
    #[serde(rename = "request.created")]
    RequestCreated,
    /// A request was approved
    #[serde(rename = "request.approved")]
    RequestApproved,
    /// A request was rejected
    #[serde(rename = "request.rejected")]
    RequestRejected,
    /// A task was assigned to someone
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    /// An entity changed status
    #[serde(rename = "status.changed")]
    StatusChanged,
    /// A notification should be rendered and sent
    #[serde(rename = "notification.requested")]
    NotificationRequested,
    /// A feature toggle was flipped
    #[serde(rename = "feature.toggled")]
    FeatureToggled,
    /// An audit record was written
    #[serde(rename = "audit.recorded")]
    AuditRecorded,
}

impl EventKind {
    /// Every known kind.
    pub const ALL: [Self; 8] = [
        Self::RequestCreated,
        Self::RequestApproved,
        Self::RequestRejected,
        Self::TaskAssigned,
        Self::StatusChanged,
        Self::NotificationRequested,
        Self::FeatureToggled,
        Self::AuditRecorded,
    ];

    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RequestCreated => "request.created",
            Self::RequestApproved => "request.approved",
            Self::RequestRejected => "request.rejected",
            Self::TaskAssigned => "task.assigned",
            Self::StatusChanged => "status.changed",
            Self::NotificationRequested => "notification.requested",
            Self::FeatureToggled => "feature.toggled",
            Self::AuditRecorded => "audit.recorded",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownEventType(s.to_string()))
    }
}

/// A decoded domain event ready to be handed to a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Publisher-assigned event id
    pub id: String,
    /// Event kind
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Id tying this event to the request/workflow that caused it
    pub correlation_id: String,
    /// Kind-specific body
    pub payload: serde_json::Value,
    /// When the event occurred
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
    /// When the event was appended to the stream, if the publisher recorded it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Loosely typed view used for validation before building an [`EventEnvelope`].
#[derive(Deserialize)]
struct RawEnvelope {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    correlation_id: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
    timestamp: Option<String>,
    published_at: Option<String>,
}

impl EventEnvelope {
    /// Build an envelope timestamped at `occurred_at`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        kind: EventKind,
        correlation_id: impl Into<String>,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            correlation_id: correlation_id.into(),
            payload,
            occurred_at,
            published_at: None,
        }
    }

    /// Decode and validate the envelope carried by `entry`.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] if the `event` field is missing, is not a
    /// JSON object, lacks `id`/`type`/`correlation_id`/`payload`/`timestamp`,
    /// names an unknown type, or carries an unparseable timestamp.
    pub fn decode(entry: &StreamEntry) -> Result<Self, EnvelopeError> {
        let json = entry
            .field(EVENT_FIELD)
            .ok_or(EnvelopeError::MissingEventField)?;
        Self::from_json(json)
    }

    /// Decode and validate an envelope from its JSON text.
    ///
    /// # Errors
    ///
    /// See [`EventEnvelope::decode`].
    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope =
            serde_json::from_str(json).map_err(|e| EnvelopeError::MalformedJson(e.to_string()))?;

        let id = required(raw.id, "id")?;
        let kind: EventKind = required(raw.kind, "type")?.parse()?;
        let correlation_id = required(raw.correlation_id, "correlation_id")?;
        if raw.payload.is_null() {
            return Err(EnvelopeError::MissingField("payload"));
        }
        let occurred_at = parse_timestamp("timestamp", &required(raw.timestamp, "timestamp")?)?;
        let published_at = raw
            .published_at
            .map(|value| parse_timestamp("published_at", &value))
            .transpose()?;

        Ok(Self {
            id,
            kind,
            correlation_id,
            payload: raw.payload,
            occurred_at,
            published_at,
        })
    }

    /// Serialize into entry fields (`event` plus the `type` shortcut).
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedJson`] if the payload cannot be serialized.
    pub fn to_fields(&self) -> Result<BTreeMap<String, String>, EnvelopeError> {
        let json =
            serde_json::to_string(self).map_err(|e| EnvelopeError::MalformedJson(e.to_string()))?;
        Ok(BTreeMap::from([
            (EVENT_FIELD.to_string(), json),
            (TYPE_FIELD.to_string(), self.kind.as_str().to_string()),
        ]))
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, EnvelopeError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(EnvelopeError::MissingField(field))
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, EnvelopeError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| EnvelopeError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

/// Best-effort event type of an entry, usable before (or without) validation.
///
/// Prefers the entry's `type` field, then the `type` key inside the `event`
/// JSON, and falls back to [`UNKNOWN_EVENT_TYPE`]. Used for metric labels and
/// dead-letter triage when decoding fails.
#[must_use]
pub fn best_effort_type(entry: &StreamEntry) -> String {
    if let Some(kind) = entry.field(TYPE_FIELD).filter(|k| !k.is_empty()) {
        return kind.to_string();
    }
    entry
        .field(EVENT_FIELD)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
        .and_then(|value| {
            value
                .get("type")
                .and_then(serde_json::Value::as_str)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string())
}

/// Bounded label for a best-effort type: the wire name of a known kind, or
/// [`UNKNOWN_EVENT_TYPE`].
///
/// Metric labels go through this so publishers cannot grow label cardinality.
#[must_use]
pub fn type_label(raw: &str) -> &'static str {
    raw.parse::<EventKind>()
        .map_or(UNKNOWN_EVENT_TYPE, |kind| kind.as_str())
}
