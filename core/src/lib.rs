//! # Relay Core
//!
//! Core types and traits for Relay, a reliable at-least-once consumer for
//! append-only event streams read through consumer groups.
//!
//! This crate holds everything the runtime and the broker adapters share:
//!
//! - [`entry`]: stream entries, entry ids and pending-entry rows
//! - [`broker`]: the [`StreamBroker`](broker::StreamBroker) trait and its errors
//! - [`envelope`]: decoding/validating raw entries into typed [`EventEnvelope`](envelope::EventEnvelope)s
//! - [`handler`]: caller-supplied handlers and the per-kind dispatch table
//! - [`dead_letter`]: records copied into the dead-letter stream
//! - [`config`]: consumer configuration with env loading and validation
//! - [`environment`]: injected dependencies (clock)
//!
//! ## Delivery model
//!
//! ```text
//!   publisher ──append──▶ stream ──read_group──▶ consumer ──handler ok──▶ ack
//!                                     ▲                    │
//!                                     │                handler err
//!                                   claim                  │
//!                               (idle ≥ threshold)         ▼
//!                                     └──────────── stays in PEL
//!                                                          │ deliveries ≥ max
//!                                                          ▼
//!                                               dead-letter stream + ack
//! ```
//!
//! The broker's pending entries list is the only source of truth about
//! in-flight work, so a consumer holds no state across restarts.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod entry;
pub mod envelope;
pub mod handler;

/// Environment module - Dependency injection traits
///
/// External dependencies that affect behaviour (currently only time) are
/// abstracted behind traits so tests can control them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use broker::{BrokerError, GroupStatus, StreamBroker};
pub use config::{ConfigError, ConsumerConfig};
pub use dead_letter::DeadLetterRecord;
pub use entry::{EntryId, PendingEntry, StartOffset, StreamEntry};
pub use envelope::{EnvelopeError, EventEnvelope, EventKind};
pub use handler::{EventHandler, HandlerError, HandlerRegistry, ProcessingFailure, handler_fn};
