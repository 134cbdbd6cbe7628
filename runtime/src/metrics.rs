//! Prometheus metrics for the consumer.
//!
//! Metric names:
//!
//! | name                                        | kind      | labels                  |
//! |---------------------------------------------|-----------|-------------------------|
//! | `relay_events_consumed_total`               | counter   | `event_type`, `consumer`|
//! | `relay_events_failed_total`                 | counter   | `event_type`, `reason`  |
//! | `relay_event_processing_duration_seconds`   | histogram | `event_type`            |
//! | `relay_events_dead_lettered_total`          | counter   | `event_type`            |
//! | `relay_entries_reclaimed_total`             | counter   | `stream`                |
//! | `relay_pending_entries`                     | gauge     | `stream`, `group`       |
//! | `relay_dlq_depth`                           | gauge     | `stream`                |
//! | `relay_loop_errors_total`                   | counter   | `stream`                |
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    fn builder() -> Result<PrometheusBuilder, MetricsError> {
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Install the recorder without an HTTP listener.
    ///
    /// Metrics are then only reachable through [`MetricsServer::render`].
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test) this logs a
    /// warning and leaves `handle()` empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime; the listener runs as a
    /// background task for the life of the process.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a recorder is already
    /// installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = Self::builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;
        self.handle = Some(handle);
        register_metrics();

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if no recorder was installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "relay_events_consumed_total",
        "Entries handled successfully and acknowledged"
    );
    describe_counter!(
        "relay_events_failed_total",
        "Processing failures (decode, missing handler, handler error)"
    );
    describe_histogram!(
        "relay_event_processing_duration_seconds",
        "Time from handler dispatch to acknowledgement"
    );
    describe_counter!(
        "relay_events_dead_lettered_total",
        "Entries moved to the dead-letter stream"
    );
    describe_counter!(
        "relay_entries_reclaimed_total",
        "Idle pending entries claimed from other consumers"
    );
    describe_gauge!(
        "relay_pending_entries",
        "Entries delivered to the group but not yet acknowledged"
    );
    describe_gauge!("relay_dlq_depth", "Number of entries in the dead-letter stream");
    describe_counter!(
        "relay_loop_errors_total",
        "Consumer loop iterations that failed with a broker error"
    );
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a successfully handled entry.
    pub fn record_consumed(event_type: &str, consumer: &str, duration: Duration) {
        counter!(
            "relay_events_consumed_total",
            "event_type" => event_type.to_string(),
            "consumer" => consumer.to_string()
        )
        .increment(1);
        histogram!(
            "relay_event_processing_duration_seconds",
            "event_type" => event_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a processing failure.
    pub fn record_failed(event_type: &str, reason: &'static str) {
        counter!(
            "relay_events_failed_total",
            "event_type" => event_type.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record an entry moved to the dead-letter stream.
    pub fn record_dead_lettered(event_type: &str) {
        counter!(
            "relay_events_dead_lettered_total",
            "event_type" => event_type.to_string()
        )
        .increment(1);
    }

    /// Record entries claimed by the reclaimer.
    pub fn record_reclaimed(stream: &str, count: usize) {
        counter!("relay_entries_reclaimed_total", "stream" => stream.to_string())
            .increment(count as u64);
    }

    /// Record the observed size of the group's pending entries list.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pending(stream: &str, group: &str, pending: u64) {
        gauge!(
            "relay_pending_entries",
            "stream" => stream.to_string(),
            "group" => group.to_string()
        )
        .set(pending as f64);
    }

    /// Record a failed loop iteration.
    pub fn record_loop_error(stream: &str) {
        counter!("relay_loop_errors_total", "stream" => stream.to_string()).increment(1);
    }

    /// Record the dead-letter stream depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_dlq_depth(stream: &str, depth: u64) {
        gauge!("relay_dlq_depth", "stream" => stream.to_string()).set(depth as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_consumer_metrics_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        ConsumerMetrics::record_consumed("task.assigned", "worker-1", Duration::from_millis(5));
        ConsumerMetrics::record_failed("task.assigned", "handler_rejected");
        ConsumerMetrics::record_dlq_depth("events:dlq", 3);

        // If another test installed the recorder first, handle is None but
        // metrics are still recorded globally.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("relay_events_consumed_total"));
            assert!(rendered.contains("relay_events_failed_total"));
            assert!(rendered.contains("relay_dlq_depth"));
        }
    }

    #[tokio::test]
    async fn test_serve_installs_or_reports_existing_recorder() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);

        // Only one global recorder per process; another test may own it.
        match server.serve() {
            Ok(()) => assert!(server.handle().is_some()),
            Err(e) => assert!(matches!(e, MetricsError::Install(_))),
        }
    }
}
