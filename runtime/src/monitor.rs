//! Dead-letter stream monitoring.
//!
//! Periodically reports the depth of the dead-letter stream and raises an
//! error-level alert once it grows past a threshold. The monitor only reads;
//! draining and reprocessing the dead-letter stream is an operator task.

use crate::metrics::ConsumerMetrics;
use crate::shutdown::StopSignal;
use relay_core::broker::{BrokerError, StreamBroker};
use relay_core::config::ConsumerConfig;
use relay_core::dead_letter::DeadLetterRecord;
use std::sync::Arc;
use std::time::Duration;

/// Result of one depth check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlqDepth {
    /// Entries in the dead-letter stream
    pub depth: u64,
    /// Whether the depth is above the alert threshold
    pub alerting: bool,
}

/// Watches the depth of one dead-letter stream.
#[derive(Clone)]
pub struct DlqMonitor {
    broker: Arc<dyn StreamBroker>,
    dlq_stream: String,
    alert_threshold: u64,
    interval: Duration,
}

impl DlqMonitor {
    /// Create a monitor for `dlq_stream`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        dlq_stream: impl Into<String>,
        alert_threshold: u64,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            dlq_stream: dlq_stream.into(),
            alert_threshold,
            interval,
        }
    }

    /// Create a monitor from a consumer configuration.
    #[must_use]
    pub fn from_config(broker: Arc<dyn StreamBroker>, config: &ConsumerConfig) -> Self {
        Self::new(
            broker,
            config.dlq_stream.clone(),
            config.dlq_alert_threshold,
            config.dlq_check_interval(),
        )
    }

    /// Read the current depth, publish it, and alert above the threshold.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the length cannot be read.
    pub async fn check(&self) -> Result<DlqDepth, BrokerError> {
        let depth = self.broker.stream_len(&self.dlq_stream).await?;
        ConsumerMetrics::record_dlq_depth(&self.dlq_stream, depth);

        let alerting = depth > self.alert_threshold;
        if alerting {
            tracing::error!(
                dlq_stream = %self.dlq_stream,
                depth,
                threshold = self.alert_threshold,
                "Dead-letter stream above threshold, manual intervention required"
            );
        } else {
            tracing::debug!(dlq_stream = %self.dlq_stream, depth, "Dead-letter stream depth");
        }
        Ok(DlqDepth { depth, alerting })
    }

    /// Newest dead-letter records, newest first.
    ///
    /// Entries that do not decode as dead-letter records are skipped.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the stream cannot be read.
    pub async fn recent(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, BrokerError> {
        let entries = self.broker.latest(&self.dlq_stream, limit).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| match DeadLetterRecord::from_dead_letter_entry(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(
                        dlq_stream = %self.dlq_stream,
                        entry_id = %entry.id,
                        error = %e,
                        "Skipping undecodable dead-letter entry"
                    );
                    None
                },
            })
            .collect())
    }

    /// Check on every tick until `stop` is triggered.
    ///
    /// The first check happens immediately. Read errors are logged and the
    /// monitor keeps going.
    pub async fn run(&self, stop: &StopSignal) {
        tracing::info!(
            dlq_stream = %self.dlq_stream,
            interval_ms = self.interval.as_millis(),
            "DLQ monitor started"
        );
        while !stop.is_triggered() {
            if let Err(e) = self.check().await {
                tracing::warn!(dlq_stream = %self.dlq_stream, error = %e, "DLQ depth check failed");
            }
            if !stop.sleep(self.interval).await {
                break;
            }
        }
        tracing::info!(dlq_stream = %self.dlq_stream, "DLQ monitor stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_core::entry::{EntryId, StreamEntry};
    use relay_testing::{InMemoryStreamBroker, Operation, fixtures};
    use relay_core::envelope::EventKind;
    use std::collections::BTreeMap;

    fn monitor(broker: &InMemoryStreamBroker, threshold: u64) -> DlqMonitor {
        DlqMonitor::new(
            Arc::new(broker.clone()),
            "events:dlq",
            threshold,
            Duration::from_secs(30),
        )
    }

    async fn dead_letter(broker: &InMemoryStreamBroker, id: &str) {
        let original = StreamEntry::new(
            EntryId::new(1, 0),
            fixtures::envelope_fields(EventKind::RequestRejected, id),
        );
        let record = DeadLetterRecord::from_entry("events", &original, "boom", Utc::now(), "w", 3);
        broker.append("events:dlq", &record.to_fields()).await.unwrap();
    }

    #[tokio::test]
    async fn check_reports_depth() {
        let broker = InMemoryStreamBroker::new();
        for i in 0..3 {
            dead_letter(&broker, &format!("e{i}")).await;
        }
        assert_eq!(
            monitor(&broker, 2).check().await.unwrap(),
            DlqDepth { depth: 3, alerting: true }
        );
        assert_eq!(
            monitor(&broker, 3).check().await.unwrap(),
            DlqDepth { depth: 3, alerting: false }
        );
        assert_eq!(
            monitor(&broker, 50).check().await.unwrap(),
            DlqDepth { depth: 3, alerting: false }
        );
    }

    #[tokio::test]
    async fn check_is_read_only() {
        let broker = InMemoryStreamBroker::new();
        dead_letter(&broker, "e1").await;
        monitor(&broker, 0).check().await.unwrap();
        assert_eq!(broker.entries("events:dlq").len(), 1);
        assert_eq!(broker.call_count(Operation::Append), 1);
    }

    #[tokio::test]
    async fn recent_returns_newest_first_and_skips_junk() {
        let broker = InMemoryStreamBroker::new();
        dead_letter(&broker, "old").await;
        broker
            .append(
                "events:dlq",
                &BTreeMap::from([("junk".to_string(), "1".to_string())]),
            )
            .await
            .unwrap();
        dead_letter(&broker, "new").await;

        let records = monitor(&broker, 50).recent(10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].event().unwrap().contains("\"new\""));
        assert!(records[1].event().unwrap().contains("\"old\""));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_signal() {
        let broker = InMemoryStreamBroker::new();
        let stop = Arc::new(StopSignal::new());
        let task = {
            let monitor = monitor(&broker, 50);
            let stop = Arc::clone(&stop);
            tokio::spawn(async move { monitor.run(&stop).await })
        };

        tokio::time::sleep(Duration::from_secs(95)).await;
        stop.trigger();
        task.await.unwrap();
        assert_eq!(broker.call_count(Operation::Range), 4);
    }
}
