//! # Relay Testing
//!
//! Testing utilities for Relay consumers.
//!
//! This crate provides:
//! - [`InMemoryStreamBroker`]: a consumer-group broker with a real PEL,
//!   blocking reads, claims, retention trimming and fault injection
//! - Scripted handlers ([`RecordingHandler`], [`FailingHandler`],
//!   [`FlakyHandler`], [`BlockingHandler`])
//! - A fixed [`Clock`] and fixture builders for envelopes and entries
//! - proptest strategies for the core types
//!
//! ## Example
//!
//! ```ignore
//! use relay_testing::{InMemoryStreamBroker, RecordingHandler, fixtures};
//! use relay_runtime::Subscription;
//!
//! #[tokio::test]
//! async fn handles_published_events() {
//!     let broker = InMemoryStreamBroker::new();
//!     fixtures::publish(&broker, "events", EventKind::TaskAssigned, "e1").await;
//!
//!     let handler = RecordingHandler::new();
//!     let registry = HandlerRegistry::new().on(EventKind::TaskAssigned, handler.clone());
//!     let subscription = Subscription::new(Arc::new(broker), config, registry)?;
//!     subscription.run_once().await?;
//!
//!     assert_eq!(handler.ids(), vec!["e1"]);
//! }
//! ```

use chrono::{DateTime, Utc};
use relay_core::environment::Clock;

pub mod broker;
pub mod handlers;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use relay_testing::mocks::FixedClock;
    /// use relay_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Builders for envelopes and stream entries.
pub mod fixtures {
    use super::Clock;
    use super::mocks::test_clock;
    use relay_core::broker::StreamBroker;
    use relay_core::entry::EntryId;
    use relay_core::envelope::{EVENT_FIELD, EventEnvelope, EventKind};
    use std::collections::BTreeMap;

    /// A valid envelope of `kind` with id `id`, stamped by [`test_clock`].
    #[must_use]
    pub fn envelope(kind: EventKind, id: &str) -> EventEnvelope {
        EventEnvelope::new(
            id,
            kind,
            format!("corr-{id}"),
            serde_json::json!({ "ref": id }),
            test_clock().now(),
        )
    }

    /// Entry fields carrying a valid envelope.
    ///
    /// # Panics
    ///
    /// Panics if the envelope cannot be serialized, which cannot happen for
    /// the JSON payloads built here.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn envelope_fields(kind: EventKind, id: &str) -> BTreeMap<String, String> {
        envelope(kind, id)
            .to_fields()
            .expect("fixture envelope serializes")
    }

    /// Entry fields whose `event` field holds `json` verbatim.
    #[must_use]
    pub fn raw_event_fields(json: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(EVENT_FIELD.to_string(), json.to_string())])
    }

    /// Append a valid envelope to `stream`.
    ///
    /// # Panics
    ///
    /// Panics if the broker rejects the append.
    #[allow(clippy::expect_used)]
    pub async fn publish(
        broker: &dyn StreamBroker,
        stream: &str,
        kind: EventKind,
        id: &str,
    ) -> EntryId {
        broker
            .append(stream, &envelope_fields(kind, id))
            .await
            .expect("append to test broker")
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use relay_core::entry::EntryId;
    use relay_core::envelope::EventKind;

    /// Any entry id.
    pub fn entry_id() -> impl Strategy<Value = EntryId> {
        (any::<u64>(), any::<u64>()).prop_map(|(millis, seq)| EntryId::new(millis, seq))
    }

    /// Any known event kind.
    pub fn event_kind() -> impl Strategy<Value = EventKind> {
        proptest::sample::select(EventKind::ALL.to_vec())
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use broker::{InMemoryStreamBroker, Operation};
pub use handlers::{BlockingHandler, FailingHandler, FlakyHandler, RecordingHandler};
pub use mocks::{FixedClock, test_clock};
