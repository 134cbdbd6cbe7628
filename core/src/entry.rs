//! Stream entries, entry identifiers and pending-entry rows.
//!
//! A stream is an append-only sequence of [`StreamEntry`] values. Every entry
//! carries a broker-assigned [`EntryId`] of the form `<millis>-<seq>` which is
//! strictly increasing within a stream, so ids order entries the same way the
//! broker does.
//!
//! # Example
//!
//! ```
//! use relay_core::entry::EntryId;
//!
//! let a: EntryId = "1700000000000-0".parse().unwrap();
//! let b: EntryId = "1700000000000-1".parse().unwrap();
//! assert!(a < b);
//! assert_eq!(b.to_string(), "1700000000000-1");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Error returned when an entry id string is not `<millis>-<seq>`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid entry id: {0}")]
pub struct InvalidEntryId(pub String);

/// Broker-assigned identifier of a stream entry.
///
/// Ordered first by the millisecond part, then by the sequence part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId {
    millis: u64,
    seq: u64,
}

impl EntryId {
    /// The smallest possible id (`0-0`).
    pub const MIN: Self = Self { millis: 0, seq: 0 };

    /// Build an id from its two components.
    #[must_use]
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Millisecond component.
    #[must_use]
    pub const fn millis(&self) -> u64 {
        self.millis
    }

    /// Sequence component.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// The id that would follow this one when appended within the same millisecond.
    #[must_use]
    pub const fn successor(&self) -> Self {
        Self {
            millis: self.millis,
            seq: self.seq + 1,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = InvalidEntryId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            // Brokers accept a bare millisecond id as shorthand for `<millis>-0`
            None => (s, "0"),
        };
        let millis = millis.parse().map_err(|_| invalid())?;
        let seq = seq.parse().map_err(|_| invalid())?;
        Ok(Self { millis, seq })
    }
}

impl TryFrom<String> for EntryId {
    type Error = InvalidEntryId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.to_string()
    }
}

/// One immutable entry of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Broker-assigned id
    pub id: EntryId,
    /// Field/value pairs carried by the entry
    pub fields: BTreeMap<String, String>,
}

impl StreamEntry {
    /// Create an entry from an id and its fields.
    #[must_use]
    pub const fn new(id: EntryId, fields: BTreeMap<String, String>) -> Self {
        Self { id, fields }
    }

    /// Look up a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// One row of a consumer group's pending entries list (PEL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Id of the delivered-but-unacknowledged entry
    pub id: EntryId,
    /// Consumer currently owning the entry
    pub consumer: String,
    /// Time since the entry was last delivered to its owner
    pub idle: Duration,
    /// How many times the entry has been delivered
    pub delivery_count: u64,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOffset {
    /// Deliver everything already in the stream.
    #[default]
    Beginning,
    /// Deliver only entries appended after the group was created.
    Latest,
    /// Deliver entries after the given id.
    After(EntryId),
}

impl StartOffset {
    /// Broker argument for this offset (`0`, `$`, or an explicit id).
    #[must_use]
    pub fn as_arg(&self) -> String {
        match self {
            Self::Beginning => "0".to_string(),
            Self::Latest => "$".to_string(),
            Self::After(id) => id.to_string(),
        }
    }
}

impl FromStr for StartOffset {
    type Err = InvalidEntryId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" | "beginning" | "earliest" => Ok(Self::Beginning),
            "$" | "latest" => Ok(Self::Latest),
            other => other.parse().map(Self::After),
        }
    }
}
