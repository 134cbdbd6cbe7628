//! Per-entry processing: decode, dispatch, acknowledge or hand to the policy.

use crate::GroupMember;
use crate::dead_letter::{DeadLetterPolicy, FailureOutcome};
use crate::metrics::ConsumerMetrics;
use relay_core::broker::StreamBroker;
use relay_core::entry::StreamEntry;
use futures::FutureExt;
use relay_core::envelope::{EventEnvelope, best_effort_type, type_label};
use relay_core::handler::{HandlerError, HandlerRegistry, ProcessingFailure};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Result of processing one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handled and acknowledged
    Acked,
    /// Handled, but the acknowledgement failed; the entry stays pending
    AckFailed,
    /// Processing failed; see the policy's decision
    Failed(FailureOutcome),
}

/// Turns a delivered entry into exactly one of: ack, retry later, dead-letter.
///
/// Never retries synchronously and never acknowledges a failed entry itself.
/// A handler that panics counts as a failed handler.
pub struct MessageProcessor {
    broker: Arc<dyn StreamBroker>,
    registry: HandlerRegistry,
    policy: DeadLetterPolicy,
}

impl MessageProcessor {
    /// Create a processor dispatching through `registry`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        registry: HandlerRegistry,
        policy: DeadLetterPolicy,
    ) -> Self {
        Self {
            broker,
            registry,
            policy,
        }
    }

    /// Process one delivered entry.
    #[tracing::instrument(
        skip(self, member, entry),
        fields(stream = %member.stream, entry_id = %entry.id, event_type = tracing::field::Empty)
    )]
    pub async fn process(&self, member: &GroupMember, entry: &StreamEntry) -> ProcessOutcome {
        let raw_type = best_effort_type(entry);
        tracing::Span::current().record("event_type", raw_type.as_str());
        let event_type = type_label(&raw_type);

        let started = Instant::now();
        if let Err(failure) = self.dispatch(entry).await {
            ConsumerMetrics::record_failed(event_type, failure.reason_prefix());
            let outcome = self.policy.on_failure(member, entry, &failure).await;
            return ProcessOutcome::Failed(outcome);
        }

        match self
            .broker
            .ack(&member.stream, &member.group, &[entry.id])
            .await
        {
            Ok(_) => {
                ConsumerMetrics::record_consumed(event_type, &member.consumer, started.elapsed());
                tracing::debug!("Event processed");
                ProcessOutcome::Acked
            },
            Err(e) => {
                tracing::error!(error = %e, "Handler succeeded but ack failed, entry stays pending");
                ProcessOutcome::AckFailed
            },
        }
    }

    async fn dispatch(&self, entry: &StreamEntry) -> Result<(), ProcessingFailure> {
        let envelope = EventEnvelope::decode(entry)?;
        let handler = self
            .registry
            .handler_for(envelope.kind)
            .ok_or(ProcessingFailure::NoHandler(envelope.kind))?;
        match AssertUnwindSafe(handler.handle(&envelope)).catch_unwind().await {
            Ok(result) => Ok(result?),
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(event_id = %envelope.id, panic = %message, "Handler panicked");
                Err(HandlerError::Other(format!("panicked: {message}")).into())
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use relay_core::entry::StartOffset;
    use relay_core::envelope::EventKind;
    use relay_core::handler::handler_fn;
    use relay_testing::{
        FailingHandler, InMemoryStreamBroker, Operation, RecordingHandler, fixtures, test_clock,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn member() -> GroupMember {
        GroupMember::new("events", "relay", "worker-1")
    }

    fn processor(broker: &InMemoryStreamBroker, registry: HandlerRegistry) -> MessageProcessor {
        let shared: Arc<dyn StreamBroker> = Arc::new(broker.clone());
        let policy =
            DeadLetterPolicy::new(Arc::clone(&shared), "events:dlq", 3, Arc::new(test_clock()));
        MessageProcessor::new(shared, registry, policy)
    }

    async fn deliver(broker: &InMemoryStreamBroker, fields: BTreeMap<String, String>) -> StreamEntry {
        broker
            .create_group("events", "relay", StartOffset::Beginning)
            .await
            .unwrap();
        broker.append("events", &fields).await.unwrap();
        broker
            .read_group("events", "relay", "worker-1", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn success_acks_once() {
        let broker = InMemoryStreamBroker::new();
        let handler = RecordingHandler::new();
        let processor = processor(
            &broker,
            HandlerRegistry::new().on(EventKind::TaskAssigned, handler.clone()),
        );
        let entry = deliver(
            &broker,
            fixtures::envelope_fields(EventKind::TaskAssigned, "e1"),
        )
        .await;

        assert_eq!(processor.process(&member(), &entry).await, ProcessOutcome::Acked);
        assert_eq!(handler.ids(), vec!["e1"]);
        assert_eq!(broker.acked("events", "relay"), vec![entry.id]);
        assert_eq!(broker.call_count(Operation::Ack), 1);
    }

    #[tokio::test]
    async fn handler_failure_leaves_entry_pending() {
        let broker = InMemoryStreamBroker::new();
        let handler = FailingHandler::new(HandlerError::Unavailable("db".into()));
        let processor = processor(
            &broker,
            HandlerRegistry::new().on(EventKind::TaskAssigned, handler.clone()),
        );
        let entry = deliver(
            &broker,
            fixtures::envelope_fields(EventKind::TaskAssigned, "e1"),
        )
        .await;

        let outcome = processor.process(&member(), &entry).await;

        assert_eq!(
            outcome,
            ProcessOutcome::Failed(FailureOutcome::WillRetry { delivery_count: 1 })
        );
        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.pending_ids("events", "relay"), vec![entry.id]);
    }

    #[tokio::test]
    async fn malformed_entry_never_reaches_handler() {
        let broker = InMemoryStreamBroker::new();
        let handler = RecordingHandler::new();
        let processor = processor(
            &broker,
            HandlerRegistry::new().on(EventKind::TaskAssigned, handler.clone()),
        );
        let entry = deliver(&broker, fixtures::raw_event_fields("{not json")).await;

        let outcome = processor.process(&member(), &entry).await;

        assert!(matches!(outcome, ProcessOutcome::Failed(_)));
        assert_eq!(handler.count(), 0);
        assert!(broker.acked("events", "relay").is_empty());
    }

    #[tokio::test]
    async fn unregistered_kind_is_a_failure() {
        let broker = InMemoryStreamBroker::new();
        let processor = processor(
            &broker,
            HandlerRegistry::new().on(EventKind::TaskAssigned, RecordingHandler::new()),
        );
        let entry = deliver(
            &broker,
            fixtures::envelope_fields(EventKind::AuditRecorded, "e1"),
        )
        .await;

        let outcome = processor.process(&member(), &entry).await;

        assert!(matches!(outcome, ProcessOutcome::Failed(FailureOutcome::WillRetry { .. })));
        assert_eq!(broker.pending_ids("events", "relay"), vec![entry.id]);
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure() {
        let broker = InMemoryStreamBroker::new();
        let processor = processor(
            &broker,
            HandlerRegistry::new().on(
                EventKind::TaskAssigned,
                handler_fn(|_| async { panic!("assignee lookup blew up") }),
            ),
        );
        let entry = deliver(
            &broker,
            fixtures::envelope_fields(EventKind::TaskAssigned, "e1"),
        )
        .await;

        let outcome = processor.process(&member(), &entry).await;

        assert_eq!(
            outcome,
            ProcessOutcome::Failed(FailureOutcome::WillRetry { delivery_count: 1 })
        );
        assert_eq!(broker.pending_ids("events", "relay"), vec![entry.id]);
        assert!(broker.acked("events", "relay").is_empty());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let text: Box<dyn Any + Send> = Box::new("static text");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned text"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*text), "static text");
        assert_eq!(panic_message(&*owned), "owned text");
        assert_eq!(panic_message(&*other), "unknown panic payload");
    }

    #[tokio::test]
    async fn failed_ack_is_reported() {
        let broker = InMemoryStreamBroker::new();
        let processor = processor(
            &broker,
            HandlerRegistry::new().on(EventKind::TaskAssigned, RecordingHandler::new()),
        );
        let entry = deliver(
            &broker,
            fixtures::envelope_fields(EventKind::TaskAssigned, "e1"),
        )
        .await;
        broker.fail_next(Operation::Ack, 1);

        assert_eq!(
            processor.process(&member(), &entry).await,
            ProcessOutcome::AckFailed
        );
        assert_eq!(broker.pending_ids("events", "relay"), vec![entry.id]);
    }
}
