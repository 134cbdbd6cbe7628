//! Retry and dead-letter policy.
//!
//! Retries happen by inaction: a failed entry is simply left unacknowledged
//! so it stays in the group's pending entries list and is reclaimed once it
//! has been idle long enough. The delivery count kept by the broker is the
//! only retry counter.
//!
//! Once an entry has been delivered `max_retries` times without success it
//! is copied to the dead-letter stream and then force-acknowledged:
//!
//! ```text
//! Fresh ─deliver─▶ Pending(1) ─fail─▶ Pending(n) ─claim─▶ Pending(n+1) ─ …
//!                      │ ok               │ n ≥ max_retries
//!                      ▼                  ▼
//!                    Acked        append to DLQ ─ok─▶ ack ─▶ DeadLettered
//! ```
//!
//! If the original entry cannot be re-read, or the append or the ack fails,
//! the entry stays pending and the move is attempted again after its next
//! delivery.

use crate::GroupMember;
use crate::metrics::ConsumerMetrics;
use relay_core::broker::StreamBroker;
use relay_core::dead_letter::DeadLetterRecord;
use relay_core::entry::{EntryId, StreamEntry};
use relay_core::envelope::type_label;
use relay_core::environment::Clock;
use relay_core::handler::ProcessingFailure;
use std::sync::Arc;

/// What the policy did with a failed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Left pending for redelivery
    WillRetry {
        /// Deliveries so far
        delivery_count: u64,
    },
    /// Copied to the dead-letter stream and acknowledged
    DeadLettered {
        /// Id of the record in the dead-letter stream
        dead_letter_id: EntryId,
    },
    /// No longer pending; another path already acknowledged it
    NotPending,
    /// The policy could not complete; the entry stays pending
    Deferred {
        /// What went wrong
        reason: String,
    },
}

/// Decides between "retry later" and "dead-letter now" for failed entries.
pub struct DeadLetterPolicy {
    broker: Arc<dyn StreamBroker>,
    dlq_stream: String,
    max_retries: u64,
    clock: Arc<dyn Clock>,
}

impl DeadLetterPolicy {
    /// Create a policy writing to `dlq_stream` after `max_retries` deliveries.
    #[must_use]
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        dlq_stream: impl Into<String>,
        max_retries: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            dlq_stream: dlq_stream.into(),
            max_retries,
            clock,
        }
    }

    /// Stream dead-letter records are appended to.
    #[must_use]
    pub fn dlq_stream(&self) -> &str {
        &self.dlq_stream
    }

    /// Handle a processing failure of `entry`.
    ///
    /// Never acknowledges the entry unless its dead-letter record has been
    /// appended first.
    pub async fn on_failure(
        &self,
        member: &GroupMember,
        entry: &StreamEntry,
        error: &ProcessingFailure,
    ) -> FailureOutcome {
        let stream = member.stream.as_str();
        let group = member.group.as_str();

        let pending = match self.broker.pending_entry(stream, group, entry.id).await {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                tracing::debug!(
                    stream,
                    group,
                    entry_id = %entry.id,
                    "Failed entry is no longer pending"
                );
                return FailureOutcome::NotPending;
            },
            Err(e) => {
                tracing::error!(
                    stream,
                    group,
                    entry_id = %entry.id,
                    error = %e,
                    "Could not read delivery count, entry stays pending"
                );
                return FailureOutcome::Deferred {
                    reason: e.to_string(),
                };
            },
        };

        if pending.delivery_count < self.max_retries {
            tracing::warn!(
                stream,
                entry_id = %entry.id,
                delivery_count = pending.delivery_count,
                max_retries = self.max_retries,
                error = %error,
                "Processing failed, will retry"
            );
            return FailureOutcome::WillRetry {
                delivery_count: pending.delivery_count,
            };
        }

        self.move_to_dead_letter(member, entry.id, pending.delivery_count, error)
            .await
    }

    async fn move_to_dead_letter(
        &self,
        member: &GroupMember,
        id: EntryId,
        delivery_count: u64,
        error: &ProcessingFailure,
    ) -> FailureOutcome {
        let stream = member.stream.as_str();
        let group = member.group.as_str();

        // Re-read the entry so the record carries what is actually stored.
        let original = match self.broker.entry(stream, id).await {
            Ok(Some(original)) => original,
            Ok(None) => {
                tracing::error!(
                    stream,
                    entry_id = %id,
                    delivery_count,
                    "Entry exhausted retries but can no longer be read, leaving it pending"
                );
                return FailureOutcome::Deferred {
                    reason: "entry no longer readable".to_string(),
                };
            },
            Err(e) => {
                tracing::error!(
                    stream,
                    entry_id = %id,
                    error = %e,
                    "Could not re-read entry for dead-lettering, leaving it pending"
                );
                return FailureOutcome::Deferred {
                    reason: e.to_string(),
                };
            },
        };

        let record = DeadLetterRecord::from_entry(
            stream,
            &original,
            error.to_string(),
            self.clock.now(),
            &member.consumer,
            delivery_count,
        );

        let dead_letter_id = match self.broker.append(&self.dlq_stream, &record.to_fields()).await {
            Ok(dead_letter_id) => dead_letter_id,
            Err(e) => {
                tracing::error!(
                    stream,
                    dlq_stream = %self.dlq_stream,
                    entry_id = %id,
                    error = %e,
                    "Failed to append to dead-letter stream, leaving entry pending"
                );
                return FailureOutcome::Deferred {
                    reason: e.to_string(),
                };
            },
        };

        if let Err(e) = self.broker.ack(stream, group, &[id]).await {
            tracing::error!(
                stream,
                group,
                entry_id = %id,
                dead_letter_id = %dead_letter_id,
                error = %e,
                "Dead-letter record written but ack failed, entry stays pending"
            );
            return FailureOutcome::Deferred {
                reason: e.to_string(),
            };
        }

        ConsumerMetrics::record_dead_lettered(type_label(&record.event_type));
        tracing::error!(
            stream,
            dlq_stream = %self.dlq_stream,
            entry_id = %id,
            dead_letter_id = %dead_letter_id,
            event_type = %record.event_type,
            delivery_count,
            error = %error,
            "Moved to DLQ"
        );
        FailureOutcome::DeadLettered { dead_letter_id }
    }
}
