//! Recovery of entries stuck in the pending entries list.
//!
//! Entries stay pending when a handler failed, or when the consumer that
//! received them crashed before acknowledging. Once such an entry has been
//! idle for at least the idle threshold, any consumer of the group may claim
//! it. The claim bumps the delivery count and resets the idle time, so the
//! retry counter advances exactly once per reclaim.
//!
//! The claim repeats the idle guard, so when several consumers reclaim at the
//! same time the broker hands each entry to at most one of them.

use crate::GroupMember;
use crate::metrics::ConsumerMetrics;
use crate::processor::{MessageProcessor, ProcessOutcome};
use relay_core::broker::{BrokerError, StreamBroker};
use relay_core::entry::EntryId;
use std::sync::Arc;
use std::time::Duration;

/// Summary of one reclaim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Idle rows listed by the broker
    pub idle: usize,
    /// Entries actually claimed by this consumer
    pub claimed: usize,
    /// Outcome per claimed entry, in claim order
    pub outcomes: Vec<ProcessOutcome>,
}

/// Claims idle pending entries and resubmits them to the processor.
pub struct Reclaimer {
    broker: Arc<dyn StreamBroker>,
    processor: Arc<MessageProcessor>,
}

impl Reclaimer {
    /// Create a reclaimer feeding `processor`.
    #[must_use]
    pub fn new(broker: Arc<dyn StreamBroker>, processor: Arc<MessageProcessor>) -> Self {
        Self { broker, processor }
    }

    /// Claim up to `max_claim` entries idle for at least `idle_threshold`
    /// and process each of them under `member`.
    ///
    /// Entries idle for less than the threshold are not touched.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if listing or claiming fails. Processing
    /// failures of claimed entries go through the retry policy and are
    /// reported in [`ReclaimReport::outcomes`].
    pub async fn reclaim(
        &self,
        member: &GroupMember,
        idle_threshold: Duration,
        max_claim: usize,
    ) -> Result<ReclaimReport, BrokerError> {
        let stream = member.stream.as_str();
        let group = member.group.as_str();

        self.observe_pending(member).await;

        let idle = self
            .broker
            .pending(stream, group, idle_threshold, max_claim)
            .await?;
        if idle.is_empty() {
            return Ok(ReclaimReport::default());
        }

        let ids: Vec<EntryId> = idle.iter().map(|row| row.id).collect();
        let claimed = self
            .broker
            .claim(stream, group, &member.consumer, idle_threshold, &ids)
            .await?;

        if !claimed.is_empty() {
            ConsumerMetrics::record_reclaimed(stream, claimed.len());
            tracing::info!(
                stream,
                group,
                consumer = %member.consumer,
                idle = idle.len(),
                claimed = claimed.len(),
                "Reclaimed idle pending entries"
            );
        }

        let mut outcomes = Vec::with_capacity(claimed.len());
        for entry in &claimed {
            outcomes.push(self.processor.process(member, entry).await);
        }

        Ok(ReclaimReport {
            idle: idle.len(),
            claimed: claimed.len(),
            outcomes,
        })
    }

    async fn observe_pending(&self, member: &GroupMember) {
        match self.broker.pending_count(&member.stream, &member.group).await {
            Ok(count) => ConsumerMetrics::record_pending(&member.stream, &member.group, count),
            Err(e) => tracing::debug!(stream = %member.stream, error = %e, "Could not read pending count"),
        }
    }
}
