//! The consumer loop.
//!
//! A [`Subscription`] binds one consumer name to one stream and group and
//! runs the loop:
//!
//! 1. stop requested? exit
//! 2. blocking read of never-delivered entries (up to `batch_size`)
//! 3. process each entry, in order
//! 4. one reclaim pass over idle pending entries
//!
//! A failed iteration is logged and counted, then the loop sleeps for
//! `error_backoff` and carries on. Only [`Subscription::stop`] ends it.

use crate::dead_letter::{DeadLetterPolicy, FailureOutcome};
use crate::group::ensure_group_with_retry;
use crate::metrics::ConsumerMetrics;
use crate::monitor::DlqMonitor;
use crate::processor::{MessageProcessor, ProcessOutcome};
use crate::reclaimer::Reclaimer;
use crate::retry::RetryPolicy;
use crate::shutdown::StopSignal;
use crate::{ConsumerError, GroupMember};
use relay_core::broker::{BrokerError, GroupStatus, StreamBroker};
use relay_core::config::ConsumerConfig;
use relay_core::entry::StreamEntry;
use relay_core::environment::{Clock, SystemClock};
use relay_core::handler::HandlerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Blocking read of up to `batch_size` never-delivered entries for `member`.
///
/// Waits at most `block_timeout` for new entries; an empty batch is normal.
///
/// # Errors
///
/// Returns a [`BrokerError`] if the read fails.
pub async fn fetch(
    broker: &dyn StreamBroker,
    member: &GroupMember,
    batch_size: usize,
    block_timeout: Duration,
) -> Result<Vec<StreamEntry>, BrokerError> {
    broker
        .read_group(
            &member.stream,
            &member.group,
            &member.consumer,
            batch_size,
            block_timeout,
        )
        .await
}

/// Counts from one loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// New entries read
    pub fetched: usize,
    /// Idle entries claimed
    pub reclaimed: usize,
    /// Entries handled and acknowledged
    pub acked: usize,
    /// Failed entries left pending for redelivery
    pub retried: usize,
    /// Entries moved to the dead-letter stream
    pub dead_lettered: usize,
    /// Entries whose ack or dead-lettering could not complete
    pub deferred: usize,
}

impl IterationReport {
    fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Acked => self.acked += 1,
            ProcessOutcome::Failed(FailureOutcome::WillRetry { .. }) => self.retried += 1,
            ProcessOutcome::Failed(FailureOutcome::DeadLettered { .. }) => {
                self.dead_lettered += 1;
            },
            ProcessOutcome::AckFailed | ProcessOutcome::Failed(FailureOutcome::Deferred { .. }) => {
                self.deferred += 1;
            },
            ProcessOutcome::Failed(FailureOutcome::NotPending) => {},
        }
    }

    /// Whether the iteration saw no entries at all.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.fetched == 0 && self.reclaimed == 0
    }
}

struct Inner {
    broker: Arc<dyn StreamBroker>,
    config: ConsumerConfig,
    member: GroupMember,
    processor: Arc<MessageProcessor>,
    reclaimer: Reclaimer,
    monitor: Option<DlqMonitor>,
    startup_retry: RetryPolicy,
    stop: StopSignal,
}

/// One consumer reading one stream through one group.
///
/// Cheap to clone; clones drive and stop the same loop.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    /// Create a subscription with default clock, startup retry and monitor.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Config`] if `config` is invalid.
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        config: ConsumerConfig,
        registry: HandlerRegistry,
    ) -> Result<Self, ConsumerError> {
        Self::builder(broker, config, registry).build()
    }

    /// Start building a subscription.
    #[must_use]
    pub fn builder(
        broker: Arc<dyn StreamBroker>,
        config: ConsumerConfig,
        registry: HandlerRegistry,
    ) -> SubscriptionBuilder {
        SubscriptionBuilder {
            broker,
            config,
            registry,
            clock: Arc::new(SystemClock),
            startup_retry: RetryPolicy::default(),
            monitor: true,
        }
    }

    /// Stream, group and consumer name of this subscription.
    #[must_use]
    pub fn member(&self) -> &GroupMember {
        &self.inner.member
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// The dead-letter monitor, if enabled.
    #[must_use]
    pub fn monitor(&self) -> Option<&DlqMonitor> {
        self.inner.monitor.as_ref()
    }

    /// Provision the stream and group, retrying transient broker errors.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if provisioning ultimately fails.
    pub async fn ensure_group(&self) -> Result<GroupStatus, BrokerError> {
        let inner = &self.inner;
        ensure_group_with_retry(
            inner.broker.as_ref(),
            &inner.member.stream,
            &inner.member.group,
            inner.config.start_offset,
            &inner.startup_retry,
        )
        .await
    }

    /// Run a single iteration: fetch, process the batch, reclaim once.
    ///
    /// Processing failures never make the iteration fail; they are handled by
    /// the retry policy and counted in the report. The reclaim pass is skipped
    /// once a stop has been requested.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the read or the reclaim listing/claim fails.
    pub async fn run_once(&self) -> Result<IterationReport, BrokerError> {
        let inner = &self.inner;
        let entries = fetch(
            inner.broker.as_ref(),
            &inner.member,
            inner.config.batch_size,
            inner.config.block_timeout(),
        )
        .await?;

        let mut report = IterationReport {
            fetched: entries.len(),
            ..IterationReport::default()
        };
        for entry in &entries {
            let outcome = inner.processor.process(&inner.member, entry).await;
            report.record(&outcome);
        }

        if inner.stop.is_triggered() {
            return Ok(report);
        }

        let reclaimed = inner
            .reclaimer
            .reclaim(
                &inner.member,
                inner.config.idle_threshold(),
                inner.config.max_claim,
            )
            .await?;
        report.reclaimed = reclaimed.claimed;
        for outcome in &reclaimed.outcomes {
            report.record(outcome);
        }

        Ok(report)
    }

    /// Provision the group, then loop until [`Subscription::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Broker`] if the group cannot be provisioned.
    /// Errors inside the loop are logged and never end it.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        let inner = &self.inner;
        let member = &inner.member;
        let status = self.ensure_group().await?;
        tracing::info!(
            stream = %member.stream,
            group = %member.group,
            consumer = %member.consumer,
            ?status,
            "Subscription started"
        );

        while !inner.stop.is_triggered() {
            match self.run_once().await {
                Ok(report) if !report.is_idle() => {
                    tracing::debug!(stream = %member.stream, ?report, "Iteration complete");
                },
                Ok(_) => {},
                Err(e) => {
                    ConsumerMetrics::record_loop_error(&member.stream);
                    let backoff = inner.config.error_backoff();
                    if e.is_transient() {
                        tracing::warn!(
                            stream = %member.stream,
                            error = %e,
                            backoff_ms = backoff.as_millis(),
                            "Consumer iteration failed"
                        );
                    } else {
                        tracing::error!(
                            stream = %member.stream,
                            error = %e,
                            backoff_ms = backoff.as_millis(),
                            "Consumer iteration failed"
                        );
                    }
                    inner.stop.sleep(backoff).await;
                },
            }
        }

        tracing::info!(
            stream = %member.stream,
            consumer = %member.consumer,
            "Subscription stopped"
        );
        Ok(())
    }

    /// Ask the loop to exit at the top of its next iteration.
    ///
    /// A fetch or handler already in flight completes, including its
    /// acknowledgement or dead-letter bookkeeping.
    pub fn stop(&self) {
        self.inner.stop.trigger();
    }

    /// Whether [`Subscription::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_triggered()
    }

    /// Spawn the loop (and the dead-letter monitor, if enabled) on the
    /// current Tokio runtime.
    #[must_use]
    pub fn start(&self) -> SubscriptionHandle {
        let looping = self.clone();
        let consumer = tokio::spawn(async move { looping.run().await });

        let monitor = self.inner.monitor.clone().map(|monitor| {
            let watching = self.clone();
            tokio::spawn(async move { monitor.run(&watching.inner.stop).await })
        });

        SubscriptionHandle {
            subscription: self.clone(),
            consumer,
            monitor,
        }
    }
}

/// Builder for [`Subscription`].
pub struct SubscriptionBuilder {
    broker: Arc<dyn StreamBroker>,
    config: ConsumerConfig,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    startup_retry: RetryPolicy,
    monitor: bool,
}

impl SubscriptionBuilder {
    /// Clock used to timestamp dead-letter records.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry policy for provisioning the group at startup.
    #[must_use]
    pub fn startup_retry(mut self, policy: RetryPolicy) -> Self {
        self.startup_retry = policy;
        self
    }

    /// Whether [`Subscription::start`] also spawns the dead-letter monitor.
    #[must_use]
    pub const fn monitor(mut self, enabled: bool) -> Self {
        self.monitor = enabled;
        self
    }

    /// Validate the configuration and assemble the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Config`] if the configuration is invalid.
    pub fn build(self) -> Result<Subscription, ConsumerError> {
        self.config.validate()?;

        let member = GroupMember::from_config(&self.config);
        let policy = DeadLetterPolicy::new(
            Arc::clone(&self.broker),
            self.config.dlq_stream.clone(),
            self.config.max_retries,
            self.clock,
        );
        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&self.broker),
            self.registry,
            policy,
        ));
        let reclaimer = Reclaimer::new(Arc::clone(&self.broker), Arc::clone(&processor));
        let monitor = self
            .monitor
            .then(|| DlqMonitor::from_config(Arc::clone(&self.broker), &self.config));

        Ok(Subscription {
            inner: Arc::new(Inner {
                broker: self.broker,
                config: self.config,
                member,
                processor,
                reclaimer,
                monitor,
                startup_retry: self.startup_retry,
                stop: StopSignal::new(),
            }),
        })
    }
}

/// Owns the tasks spawned by [`Subscription::start`].
pub struct SubscriptionHandle {
    subscription: Subscription,
    consumer: JoinHandle<Result<(), ConsumerError>>,
    monitor: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// The running subscription.
    #[must_use]
    pub const fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Request a stop; see [`Subscription::stop`].
    pub fn stop(&self) {
        self.subscription.stop();
    }

    /// Wait for the loop and the monitor to finish.
    ///
    /// If the loop ends on its own (provisioning failed) the monitor is
    /// stopped too.
    ///
    /// # Errors
    ///
    /// Returns the loop's error, or [`ConsumerError::Task`] if a task panicked.
    pub async fn join(self) -> Result<(), ConsumerError> {
        let result = self
            .consumer
            .await
            .map_err(|e| ConsumerError::Task(e.to_string()))
            .and_then(|r| r);

        self.subscription.stop();
        if let Some(monitor) = self.monitor {
            monitor
                .await
                .map_err(|e| ConsumerError::Task(e.to_string()))?;
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relay_core::envelope::EventKind;
    use relay_testing::{InMemoryStreamBroker, Operation, RecordingHandler, fixtures, test_clock};

    fn config() -> ConsumerConfig {
        ConsumerConfig::builder()
            .stream("events")
            .group("relay")
            .consumer("worker-1")
            .block_timeout(Duration::from_millis(50))
            .error_backoff(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    fn subscription(broker: &InMemoryStreamBroker, handler: &RecordingHandler) -> Subscription {
        Subscription::builder(
            Arc::new(broker.clone()),
            config(),
            HandlerRegistry::new().on(EventKind::RequestApproved, handler.clone()),
        )
        .clock(Arc::new(test_clock()))
        .monitor(false)
        .build()
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut bad = config();
        bad.batch_size = 0;
        let result = Subscription::new(
            Arc::new(InMemoryStreamBroker::new()),
            bad,
            HandlerRegistry::new(),
        );
        assert!(matches!(result, Err(ConsumerError::Config(_))));
    }

    #[tokio::test]
    async fn run_once_processes_batch_in_order() {
        let broker = InMemoryStreamBroker::new();
        let handler = RecordingHandler::new();
        let sub = subscription(&broker, &handler);
        sub.ensure_group().await.unwrap();
        for id in ["a", "b", "c"] {
            fixtures::publish(&broker, "events", EventKind::RequestApproved, id).await;
        }

        let report = sub.run_once().await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.acked, 3);
        assert_eq!(handler.ids(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_broker_errors() {
        let broker = InMemoryStreamBroker::new();
        let handler = RecordingHandler::new();
        let sub = subscription(&broker, &handler);
        broker.fail_next(Operation::Read, 3);
        fixtures::publish(&broker, "events", EventKind::RequestApproved, "a").await;

        let handle = sub.start();
        while handler.count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop();
        handle.join().await.unwrap();

        assert_eq!(handler.ids(), vec!["a"]);
        assert!(broker.call_count(Operation::Read) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_idle_loop() {
        let broker = InMemoryStreamBroker::new();
        let sub = subscription(&broker, &RecordingHandler::new());

        let handle = sub.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!handle.subscription().is_stopped());

        handle.stop();
        handle.join().await.unwrap();
        assert!(sub.is_stopped());
    }
}
