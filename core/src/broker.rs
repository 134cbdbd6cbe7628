//! Broker abstraction for append-only streams with consumer groups.
//!
//! The [`StreamBroker`] trait is the only seam between the consumer and the log
//! that stores events. Any ordered, appendable log that offers consumer groups
//! with a per-group pending entries list (PEL) can implement it.
//!
//! # Ownership model
//!
//! The broker, not the consumer, is the single source of truth for who owns an
//! unacknowledged entry:
//!
//! - a new entry is handed to exactly one consumer of a group by [`StreamBroker::read_group`]
//! - the entry then sits in the PEL until [`StreamBroker::ack`] removes it
//! - [`StreamBroker::claim`] moves ownership to another consumer once the entry
//!   has been idle long enough, incrementing its delivery count
//!
//! # Implementations
//!
//! - `InMemoryStreamBroker` in `relay-testing` - for tests (deterministic, fault injection)
//! - `RedisStreamBroker` in `relay-redis` - for production (Redis Streams)
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` rather than using `async fn` so the
//! consumer can hold an `Arc<dyn StreamBroker>` shared by its loop and monitor.

use crate::entry::{EntryId, PendingEntry, StartOffset, StreamEntry};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The consumer group already exists on the stream
    #[error("Consumer group '{group}' already exists on stream '{stream}'")]
    GroupAlreadyExists {
        /// Stream name
        stream: String,
        /// Group name
        group: String,
    },

    /// The consumer group (or its stream) does not exist
    #[error("Consumer group '{group}' does not exist on stream '{stream}'")]
    NoSuchGroup {
        /// Stream name
        stream: String,
        /// Group name
        group: String,
    },

    /// A broker command was rejected
    #[error("{command} failed: {reason}")]
    CommandFailed {
        /// The command that failed (e.g. `XACK`)
        command: &'static str,
        /// Reason reported by the broker
        reason: String,
    },

    /// Network, timeout or other transport level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker replied with something that could not be decoded
    #[error("Failed to decode broker reply: {0}")]
    Decode(String),
}

impl BrokerError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Connection and transport failures are transient; everything else
    /// reflects a state or protocol problem that a retry will not fix.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Transport(_))
    }
}

/// Outcome of provisioning a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// The group was created by this call
    Created,
    /// The group was already present
    AlreadyExists,
}

/// Boxed future returned by [`StreamBroker`] methods.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Trait for stream brokers with consumer-group semantics.
///
/// All implementations must be `Send + Sync`; one broker is shared by every
/// subscription and monitor in a process.
pub trait StreamBroker: Send + Sync {
    /// Create `group` on `stream` anchored at `start`, creating the stream if absent.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::GroupAlreadyExists`] if the group is already
    /// present, or another [`BrokerError`] if the command fails.
    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartOffset,
    ) -> BrokerFuture<'_, ()>;

    /// Read up to `count` never-delivered entries for `consumer`.
    ///
    /// Blocks for at most `block` when nothing is available. An empty result
    /// is a normal timeout, not an error. Returned entries enter the PEL owned
    /// by `consumer` with a delivery count of 1.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the read fails.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerFuture<'_, Vec<StreamEntry>>;

    /// List up to `count` PEL rows that have been idle for at least `min_idle`,
    /// oldest id first.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the query fails.
    fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerFuture<'_, Vec<PendingEntry>>;

    /// Look up the PEL row of a single entry, if it is still pending.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the query fails.
    fn pending_entry(
        &self,
        stream: &str,
        group: &str,
        id: EntryId,
    ) -> BrokerFuture<'_, Option<PendingEntry>>;

    /// Total number of entries in the group's PEL.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the query fails.
    fn pending_count(&self, stream: &str, group: &str) -> BrokerFuture<'_, u64>;

    /// Transfer ownership of `ids` to `consumer`, but only for entries still
    /// idle for at least `min_idle`.
    ///
    /// Each claimed entry has its delivery count incremented and its idle time
    /// reset. Entries that are no longer pending or not idle enough are
    /// omitted from the result. Idle entries whose content has been trimmed
    /// away are omitted too, and their PEL rows are deleted.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the command fails.
    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> BrokerFuture<'_, Vec<StreamEntry>>;

    /// Acknowledge `ids`, removing them from the PEL. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the command fails.
    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> BrokerFuture<'_, u64>;

    /// Append a new entry and return its broker-assigned id.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the append fails.
    fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> BrokerFuture<'_, EntryId>;

    /// Read a single entry by id, if it still exists.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the read fails.
    fn entry(&self, stream: &str, id: EntryId) -> BrokerFuture<'_, Option<StreamEntry>>;

    /// Read up to `count` of the newest entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the read fails.
    fn latest(&self, stream: &str, count: usize) -> BrokerFuture<'_, Vec<StreamEntry>>;

    /// Number of entries in `stream` (0 if the stream does not exist).
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the query fails.
    fn stream_len(&self, stream: &str) -> BrokerFuture<'_, u64>;
}
