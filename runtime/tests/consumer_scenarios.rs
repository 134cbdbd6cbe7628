//! End-to-end consumer behaviour against the in-memory broker.
//!
//! Redelivery tests run with a zero idle threshold so every `run_once`
//! reclaims the entries that failed before it, one delivery per pass.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use proptest::prelude::*;
use relay_core::broker::StreamBroker;
use relay_core::config::ConsumerConfig;
use relay_core::dead_letter::DeadLetterRecord;
use relay_core::entry::{EntryId, StartOffset};
use relay_core::envelope::EventKind;
use relay_core::handler::{HandlerError, HandlerRegistry, handler_fn};
use relay_runtime::{ConsumerError, IterationReport, Subscription, ensure_group};
use relay_testing::{
    BlockingHandler, FailingHandler, FlakyHandler, InMemoryStreamBroker, Operation,
    RecordingHandler, fixtures, init_test_tracing, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

const STREAM: &str = "events";
const GROUP: &str = "relay";
const DLQ: &str = "events:dlq";

fn config(consumer: &str, max_retries: u64) -> ConsumerConfig {
    ConsumerConfig::builder()
        .stream(STREAM)
        .group(GROUP)
        .consumer(consumer)
        .dlq_stream(DLQ)
        .max_retries(max_retries)
        .block_timeout(Duration::ZERO)
        .idle_threshold(Duration::ZERO)
        .error_backoff(Duration::from_millis(10))
        .build()
        .unwrap()
}

fn subscription(
    broker: &InMemoryStreamBroker,
    config: ConsumerConfig,
    registry: HandlerRegistry,
) -> Subscription {
    init_test_tracing();
    Subscription::builder(Arc::new(broker.clone()), config, registry)
        .clock(Arc::new(test_clock()))
        .monitor(false)
        .build()
        .unwrap()
}

async fn run_iterations(sub: &Subscription, iterations: usize) -> IterationReport {
    let mut total = IterationReport::default();
    for _ in 0..iterations {
        let report = sub.run_once().await.unwrap();
        total.fetched += report.fetched;
        total.reclaimed += report.reclaimed;
        total.acked += report.acked;
        total.retried += report.retried;
        total.dead_lettered += report.dead_lettered;
        total.deferred += report.deferred;
    }
    total
}

fn dead_letters(broker: &InMemoryStreamBroker) -> Vec<DeadLetterRecord> {
    broker
        .entries(DLQ)
        .iter()
        .map(|entry| DeadLetterRecord::from_dead_letter_entry(entry).unwrap())
        .collect()
}

#[tokio::test]
async fn always_failing_entry_is_dead_lettered_after_max_retries() {
    let broker = InMemoryStreamBroker::new();
    let handler = FailingHandler::new(HandlerError::Rejected("approver missing".into()));
    let sub = subscription(
        &broker,
        config("worker-1", 3),
        HandlerRegistry::new().on(EventKind::RequestCreated, handler.clone()),
    );
    sub.ensure_group().await.unwrap();
    let id = fixtures::publish(&broker, STREAM, EventKind::RequestCreated, "req-1").await;

    let report = run_iterations(&sub, 2).await;

    assert_eq!(handler.calls(), 3);
    assert_eq!(report.retried, 2);
    assert_eq!(report.dead_lettered, 1);

    let records = dead_letters(&broker);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_id, id);
    assert_eq!(records[0].original_stream, STREAM);
    assert_eq!(records[0].error, "handler rejected: approver missing");
    assert_eq!(records[0].event_type, "request.created");
    assert_eq!(records[0].delivery_count, 3);
    assert!(broker.pending_ids(STREAM, GROUP).is_empty());
}

#[tokio::test]
async fn dead_lettered_entry_is_never_processed_again() {
    let broker = InMemoryStreamBroker::new();
    let handler = FailingHandler::new(HandlerError::Other("boom".into()));
    let sub = subscription(
        &broker,
        config("worker-1", 3),
        HandlerRegistry::new().on(EventKind::RequestCreated, handler.clone()),
    );
    sub.ensure_group().await.unwrap();
    fixtures::publish(&broker, STREAM, EventKind::RequestCreated, "req-1").await;

    run_iterations(&sub, 2).await;
    let after = run_iterations(&sub, 5).await;

    assert!(after.is_idle());
    assert_eq!(handler.calls(), 3);
    assert_eq!(dead_letters(&broker).len(), 1);
}

#[tokio::test]
async fn entry_succeeding_on_third_delivery_is_acked_without_dead_letter() {
    let broker = InMemoryStreamBroker::new();
    let handler = FlakyHandler::new(2);
    let sub = subscription(
        &broker,
        config("worker-1", 3),
        HandlerRegistry::new().on(EventKind::TaskAssigned, handler.clone()),
    );
    sub.ensure_group().await.unwrap();
    let id = fixtures::publish(&broker, STREAM, EventKind::TaskAssigned, "task-1").await;

    run_iterations(&sub, 3).await;

    assert_eq!(handler.calls(), 3);
    assert_eq!(handler.succeeded().len(), 1);
    assert_eq!(broker.acked(STREAM, GROUP), vec![id]);
    assert!(broker.entries(DLQ).is_empty());
}

#[tokio::test]
async fn successful_entries_are_acked_once_in_fetch_order() {
    let broker = InMemoryStreamBroker::new();
    let handler = RecordingHandler::new();
    let sub = subscription(
        &broker,
        config("worker-1", 3),
        HandlerRegistry::new().on(EventKind::StatusChanged, handler.clone()),
    );
    sub.ensure_group().await.unwrap();
    let mut published = Vec::new();
    for i in 0..5 {
        published
            .push(fixtures::publish(&broker, STREAM, EventKind::StatusChanged, &format!("s{i}")).await);
    }

    let first = sub.run_once().await.unwrap();
    let rest = run_iterations(&sub, 3).await;

    assert_eq!(first.acked, 5);
    assert!(rest.is_idle());
    assert_eq!(broker.acked(STREAM, GROUP), published);
    assert_eq!(handler.ids(), vec!["s0", "s1", "s2", "s3", "s4"]);
}

#[tokio::test]
async fn ensure_group_twice_creates_one_group() {
    let broker = InMemoryStreamBroker::new();
    ensure_group(&broker, STREAM, GROUP, StartOffset::Beginning)
        .await
        .unwrap();
    ensure_group(&broker, STREAM, GROUP, StartOffset::Beginning)
        .await
        .unwrap();
    assert_eq!(broker.group_count(STREAM), 1);
}

#[tokio::test]
async fn competing_consumers_do_not_share_a_new_entry() {
    let broker = InMemoryStreamBroker::new();
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    let sub_a = subscription(
        &broker,
        ConsumerConfig {
            idle_threshold_ms: 60_000,
            ..config("worker-a", 3)
        },
        HandlerRegistry::new().on(EventKind::FeatureToggled, first.clone()),
    );
    let sub_b = subscription(
        &broker,
        ConsumerConfig {
            idle_threshold_ms: 60_000,
            ..config("worker-b", 3)
        },
        HandlerRegistry::new().on(EventKind::FeatureToggled, second.clone()),
    );
    sub_a.ensure_group().await.unwrap();
    sub_b.ensure_group().await.unwrap();
    fixtures::publish(&broker, STREAM, EventKind::FeatureToggled, "f1").await;

    let (a, b) = tokio::join!(sub_a.run_once(), sub_b.run_once());

    assert_eq!(a.unwrap().fetched + b.unwrap().fetched, 1);
    assert_eq!(first.count() + second.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_entry_is_reclaimed_by_exactly_one_consumer() {
    let broker = InMemoryStreamBroker::new();
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    let slow_config = |name: &str| ConsumerConfig {
        idle_threshold_ms: 60_000,
        ..config(name, 3)
    };
    let sub_a = subscription(
        &broker,
        slow_config("worker-a"),
        HandlerRegistry::new().on(EventKind::AuditRecorded, first.clone()),
    );
    let sub_b = subscription(
        &broker,
        slow_config("worker-b"),
        HandlerRegistry::new().on(EventKind::AuditRecorded, second.clone()),
    );
    sub_a.ensure_group().await.unwrap();
    let id = fixtures::publish(&broker, STREAM, EventKind::AuditRecorded, "a1").await;

    // A consumer that crashes right after reading.
    broker
        .read_group(STREAM, GROUP, "crashed", 10, Duration::ZERO)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;

    let (a, b) = tokio::join!(sub_a.run_once(), sub_b.run_once());

    assert_eq!(a.unwrap().reclaimed + b.unwrap().reclaimed, 1);
    assert_eq!(first.count() + second.count(), 1);
    assert_eq!(broker.acked(STREAM, GROUP), vec![id]);
}

#[tokio::test]
async fn stop_lets_in_flight_handler_finish_and_fetches_nothing_new() {
    let broker = InMemoryStreamBroker::new();
    let handler = BlockingHandler::new();
    let sub = subscription(
        &broker,
        ConsumerConfig {
            block_timeout_ms: 20,
            ..config("worker-1", 3)
        },
        HandlerRegistry::new().on(EventKind::NotificationRequested, handler.clone()),
    );
    let first = fixtures::publish(&broker, STREAM, EventKind::NotificationRequested, "n1").await;

    let handle = sub.start();
    handler.wait_started().await;
    handle.stop();
    let second = fixtures::publish(&broker, STREAM, EventKind::NotificationRequested, "n2").await;
    handler.release(1);
    handle.join().await.unwrap();

    assert_eq!(handler.finished().len(), 1);
    assert_eq!(broker.acked(STREAM, GROUP), vec![first]);
    assert!(broker.pending_ids(STREAM, GROUP).is_empty());

    // n2 was never delivered to the stopped consumer.
    let remaining = broker
        .read_group(STREAM, GROUP, "worker-2", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(remaining.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second]);
}

#[tokio::test]
async fn stop_completes_dead_lettering_of_in_flight_entry() {
    let broker = InMemoryStreamBroker::new();
    let gate = BlockingHandler::new();
    let failing = {
        let gate = gate.clone();
        handler_fn(move |envelope| {
            let gate = gate.clone();
            async move {
                relay_core::handler::EventHandler::handle(&gate, &envelope).await?;
                Err(HandlerError::Rejected("always".into()))
            }
        })
    };
    let sub = subscription(
        &broker,
        ConsumerConfig {
            block_timeout_ms: 20,
            ..config("worker-1", 1)
        },
        HandlerRegistry::new().on(EventKind::RequestRejected, failing),
    );
    let id = fixtures::publish(&broker, STREAM, EventKind::RequestRejected, "r1").await;

    let handle = sub.start();
    gate.wait_started().await;
    handle.stop();
    gate.release(1);
    handle.join().await.unwrap();

    let records = dead_letters(&broker);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_id, id);
    assert!(broker.pending_ids(STREAM, GROUP).is_empty());
}

#[tokio::test]
async fn invalid_envelopes_take_the_dead_letter_path() {
    let broker = InMemoryStreamBroker::new();
    let handler = RecordingHandler::new();
    let sub = subscription(
        &broker,
        config("worker-1", 2),
        HandlerRegistry::new().on(EventKind::TaskAssigned, handler.clone()),
    );
    sub.ensure_group().await.unwrap();
    let id = broker
        .append(
            STREAM,
            &fixtures::raw_event_fields(r#"{"id":"x","type":"task.assigned"}"#),
        )
        .await
        .unwrap();

    let report = sub.run_once().await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(handler.count(), 0);
    let records = dead_letters(&broker);
    assert_eq!(records[0].original_id, id);
    assert_eq!(records[0].event_type, "task.assigned");
    assert!(records[0].error.contains("correlation_id"));
}

#[tokio::test]
async fn unknown_event_type_is_dead_lettered_not_dropped() {
    let broker = InMemoryStreamBroker::new();
    let sub = subscription(
        &broker,
        config("worker-1", 1),
        HandlerRegistry::new().on(EventKind::TaskAssigned, RecordingHandler::new()),
    );
    sub.ensure_group().await.unwrap();
    broker
        .append(
            STREAM,
            &fixtures::raw_event_fields(
                r#"{"id":"x","type":"invoice.paid","correlation_id":"c","payload":{},"timestamp":"2025-01-01T00:00:00Z"}"#,
            ),
        )
        .await
        .unwrap();

    let report = sub.run_once().await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(dead_letters(&broker)[0].event_type, "invoice.paid");
}

#[tokio::test]
async fn panicking_handler_is_dead_lettered_and_the_loop_keeps_running() {
    let broker = InMemoryStreamBroker::new();
    let recorder = RecordingHandler::new();
    let sub = subscription(
        &broker,
        ConsumerConfig {
            block_timeout_ms: 20,
            ..config("worker-1", 1)
        },
        HandlerRegistry::new()
            .on(
                EventKind::AuditRecorded,
                handler_fn(|_| async { panic!("audit sink exploded") }),
            )
            .on(EventKind::TaskAssigned, recorder.clone()),
    );
    sub.ensure_group().await.unwrap();
    let bad = fixtures::publish(&broker, STREAM, EventKind::AuditRecorded, "a1").await;

    let handle = sub.start();
    let good = fixtures::publish(&broker, STREAM, EventKind::TaskAssigned, "t1").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.count() == 0 || dead_letters(&broker).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loop should survive the panic");
    handle.stop();
    handle.join().await.unwrap();

    let records = dead_letters(&broker);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_id, bad);
    assert!(records[0].error.contains("panicked: audit sink exploded"));
    assert_eq!(recorder.ids(), vec!["t1"]);
    assert_eq!(broker.acked(STREAM, GROUP), vec![bad, good]);
    assert!(broker.pending_ids(STREAM, GROUP).is_empty());
}

#[tokio::test]
async fn failed_dead_letter_append_is_retried_on_next_delivery() {
    let broker = InMemoryStreamBroker::new();
    let handler = FailingHandler::new(HandlerError::Unavailable("db".into()));
    let sub = subscription(
        &broker,
        config("worker-1", 2),
        HandlerRegistry::new().on(EventKind::RequestApproved, handler.clone()),
    );
    sub.ensure_group().await.unwrap();
    let id = fixtures::publish(&broker, STREAM, EventKind::RequestApproved, "a1").await;
    broker.fail_next(Operation::Append, 1);

    let first = sub.run_once().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(first.deferred, 1);
    assert_eq!(broker.pending_ids(STREAM, GROUP), vec![id]);

    let second = sub.run_once().await.unwrap();
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(dead_letters(&broker).len(), 1);
    assert!(broker.pending_ids(STREAM, GROUP).is_empty());
}

#[tokio::test]
async fn trimmed_entry_stays_pending_instead_of_being_dead_lettered() {
    let broker = InMemoryStreamBroker::new();
    let trimming = {
        let broker = broker.clone();
        handler_fn(move |_envelope| {
            let broker = broker.clone();
            async move {
                for entry in broker.entries(STREAM) {
                    broker.trim(STREAM, entry.id);
                }
                Err(HandlerError::Other("after trim".into()))
            }
        })
    };
    let sub = subscription(
        &broker,
        ConsumerConfig {
            idle_threshold_ms: 60_000,
            ..config("worker-1", 1)
        },
        HandlerRegistry::new().on(EventKind::StatusChanged, trimming),
    );
    sub.ensure_group().await.unwrap();
    let id: EntryId = fixtures::publish(&broker, STREAM, EventKind::StatusChanged, "s1").await;

    let report = sub.run_once().await.unwrap();

    assert_eq!(report.deferred, 1);
    assert!(broker.entries(DLQ).is_empty());
    assert_eq!(broker.pending_ids(STREAM, GROUP), vec![id]);
}

#[tokio::test]
async fn trimmed_rows_do_not_block_reclaiming_live_entries() {
    let broker = InMemoryStreamBroker::new();
    let recorder = RecordingHandler::new();
    let sub = subscription(
        &broker,
        ConsumerConfig {
            max_claim: 2,
            ..config("worker-1", 3)
        },
        HandlerRegistry::new().on(EventKind::StatusChanged, recorder.clone()),
    );
    sub.ensure_group().await.unwrap();
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(fixtures::publish(&broker, STREAM, EventKind::StatusChanged, &format!("s{i}")).await);
    }
    broker
        .read_group(STREAM, GROUP, "crashed", 10, Duration::ZERO)
        .await
        .unwrap();
    broker.trim(STREAM, ids[0]);
    broker.trim(STREAM, ids[1]);

    let first = sub.run_once().await.unwrap();
    assert_eq!(first.reclaimed, 0);
    assert_eq!(broker.pending_ids(STREAM, GROUP), vec![ids[2]]);

    let second = sub.run_once().await.unwrap();
    assert_eq!(second.reclaimed, 1);
    assert_eq!(recorder.ids(), vec!["s2"]);
    assert!(broker.pending_ids(STREAM, GROUP).is_empty());
}

#[tokio::test]
async fn provisioning_failure_is_reported_by_join() {
    let broker = InMemoryStreamBroker::new();
    broker.fail_next(Operation::CreateGroup, 1);
    init_test_tracing();
    let sub = Subscription::builder(
        Arc::new(broker.clone()),
        config("worker-1", 3),
        HandlerRegistry::new(),
    )
    .startup_retry(relay_runtime::RetryPolicy::none())
    .build()
    .unwrap();

    let result = sub.start().join().await;

    assert!(matches!(result, Err(ConsumerError::Broker(_))));
}

#[tokio::test]
async fn monitor_reports_dead_letter_depth() {
    let broker = InMemoryStreamBroker::new();
    let sub = Subscription::builder(
        Arc::new(broker.clone()),
        config("worker-1", 1),
        HandlerRegistry::new(),
    )
    .clock(Arc::new(test_clock()))
    .build()
    .unwrap();
    sub.ensure_group().await.unwrap();
    for i in 0..3 {
        fixtures::publish(&broker, STREAM, EventKind::AuditRecorded, &format!("a{i}")).await;
    }

    sub.run_once().await.unwrap();
    let monitor = sub.monitor().unwrap();

    let status = monitor.check().await.unwrap();
    assert_eq!(status.depth, 3);
    assert!(!status.alerting);
    let recent = monitor.recent(2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent[0].error.contains("no handler"));
    assert!(recent[0].original_id > recent[1].original_id);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_published_entry_is_acked_once_in_order(count in 1usize..40, batch in 1usize..8) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let broker = InMemoryStreamBroker::new();
            let handler = RecordingHandler::new();
            let sub = subscription(
                &broker,
                ConsumerConfig { batch_size: batch, ..config("worker-1", 3) },
                HandlerRegistry::new().on(EventKind::StatusChanged, handler.clone()),
            );
            sub.ensure_group().await.unwrap();
            let mut published = Vec::new();
            for i in 0..count {
                published.push(
                    fixtures::publish(&broker, STREAM, EventKind::StatusChanged, &i.to_string()).await,
                );
            }

            let iterations = count.div_ceil(batch) + 1;
            run_iterations(&sub, iterations).await;

            prop_assert_eq!(broker.acked(STREAM, GROUP), published);
            prop_assert_eq!(handler.count(), count);
            prop_assert!(broker.pending_ids(STREAM, GROUP).is_empty());
            Ok(())
        })?;
    }
}
