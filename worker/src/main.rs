//! Relay worker.
//!
//! Runs one consumer-group subscription per configured stream against Redis
//! until SIGTERM or Ctrl+C, then stops every subscription and waits for the
//! in-flight entries to finish.
//!
//! # Environment
//!
//! | variable         | default                    |
//! |------------------|----------------------------|
//! | `REDIS_URL`      | `redis://127.0.0.1:6379`   |
//! | `RELAY_STREAMS`  | the `RELAY_STREAM` setting |
//! | `METRICS_ADDR`   | unset (no `/metrics`)      |
//! | `RUST_LOG`       | `info`                     |
//!
//! Every `RELAY_*` consumer setting (group, consumer name, retries, timeouts,
//! DLQ stream) is read by [`ConsumerConfig::from_env`].
//!
//! The built-in handlers only log each event. Deployments embed
//! [`relay_runtime::Subscription`] with their own [`HandlerRegistry`].

use anyhow::Context;
use relay_core::config::ConsumerConfig;
use relay_core::envelope::{EventEnvelope, EventKind};
use relay_core::handler::{EventHandler, HandlerRegistry, handler_fn};
use relay_redis::RedisStreamBroker;
use relay_runtime::{MetricsServer, Subscription, SubscriptionHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let base = ConsumerConfig::from_env().context("invalid consumer configuration")?;
    let streams = streams_from_env(&base);
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());

    let _metrics = match std::env::var("METRICS_ADDR") {
        Ok(addr) => {
            let addr: SocketAddr = addr.parse().context("METRICS_ADDR is not a socket address")?;
            let mut server = MetricsServer::new(addr);
            server.serve()?;
            Some(server)
        },
        Err(_) => None,
    };

    let broker = Arc::new(
        RedisStreamBroker::connect(&redis_url)
            .await
            .context("failed to connect to Redis")?,
    );

    let mut handles: Vec<SubscriptionHandle> = Vec::with_capacity(streams.len());
    for stream in &streams {
        let config = base.for_stream(stream.as_str());
        let subscription = Subscription::builder(broker.clone(), config, logging_registry()).build()?;
        handles.push(subscription.start());
    }
    tracing::info!(
        streams = ?streams,
        group = %base.group,
        consumer = %base.consumer,
        "Relay worker started"
    );

    wait_for_signal().await?;

    tracing::info!("Shutting down, finishing in-flight entries");
    for handle in &handles {
        handle.stop();
    }

    let mut failed = false;
    for handle in handles {
        let stream = handle.subscription().member().stream.clone();
        if let Err(e) = handle.join().await {
            tracing::error!(stream = %stream, error = %e, "Subscription ended with an error");
            failed = true;
        }
    }
    tracing::info!("Relay worker stopped");

    if failed {
        anyhow::bail!("one or more subscriptions failed");
    }
    Ok(())
}

/// `RELAY_STREAMS` as a comma-separated list, or the single configured stream.
fn streams_from_env(base: &ConsumerConfig) -> Vec<String> {
    parse_streams(std::env::var("RELAY_STREAMS").ok().as_deref(), &base.stream)
}

fn parse_streams(raw: Option<&str>, fallback: &str) -> Vec<String> {
    let mut streams: Vec<String> = Vec::new();
    for stream in raw.unwrap_or_default().split(',').map(str::trim) {
        if !stream.is_empty() && !streams.iter().any(|s| s == stream) {
            streams.push(stream.to_string());
        }
    }
    if streams.is_empty() {
        streams.push(fallback.to_string());
    }
    streams
}

fn logging_registry() -> HandlerRegistry {
    let log: Arc<dyn EventHandler> = Arc::new(handler_fn(|envelope: EventEnvelope| async move {
        tracing::info!(
            event_id = %envelope.id,
            event_type = envelope.kind.as_str(),
            correlation_id = %envelope.correlation_id,
            "Event received"
        );
        Ok(())
    }));
    HandlerRegistry::new().on_each(&EventKind::ALL, log)
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to wait for Ctrl+C")?;
                tracing::info!("Received Ctrl+C");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for Ctrl+C")?;
        tracing::info!("Received Ctrl+C");
    }
    Ok(())
}
