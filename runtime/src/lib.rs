//! # Relay Runtime
//!
//! The consumer runtime: everything between the broker and the handlers.
//!
//! ## Core Components
//!
//! - **Group manager** ([`group`]): idempotent stream/group provisioning
//! - **Subscription** ([`subscription`]): the fetch → process → reclaim loop
//! - **Message processor** ([`processor`]): decode, dispatch, acknowledge
//! - **Reclaimer** ([`reclaimer`]): claims entries idle past the threshold
//! - **Dead-letter policy** ([`dead_letter`]): retry later or move to the DLQ
//! - **DLQ monitor** ([`monitor`]): depth gauge and alerting
//!
//! ## Example
//!
//! ```ignore
//! use relay_runtime::Subscription;
//! use relay_core::{ConsumerConfig, EventKind, HandlerRegistry, handler_fn};
//!
//! let registry = HandlerRegistry::new()
//!     .on(EventKind::TaskAssigned, handler_fn(|envelope| async move {
//!         assign(envelope.payload).await
//!     }));
//!
//! let subscription = Subscription::new(broker, ConsumerConfig::from_env()?, registry)?;
//! let handle = subscription.start();
//!
//! tokio::signal::ctrl_c().await?;
//! handle.stop();
//! handle.join().await?;
//! ```

use relay_core::broker::BrokerError;
use relay_core::config::{ConfigError, ConsumerConfig};
use thiserror::Error;

pub mod dead_letter;
pub mod group;
pub mod metrics;
pub mod monitor;
pub mod processor;
pub mod reclaimer;
pub mod retry;
pub mod shutdown;
pub mod subscription;

/// Errors that stop a subscription from running.
///
/// Processing failures never surface here; they are handled per entry by
/// the retry and dead-letter policy.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The configuration failed validation
    #[error("Invalid consumer configuration: {0}")]
    Config(#[from] ConfigError),

    /// The broker rejected provisioning
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A spawned task panicked or was cancelled
    #[error("Consumer task failed: {0}")]
    Task(String),
}

/// The identity a subscription reads under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupMember {
    /// Stream read from
    pub stream: String,
    /// Consumer group
    pub group: String,
    /// Consumer name within the group
    pub consumer: String,
}

impl GroupMember {
    /// Create a member identity.
    #[must_use]
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    /// The identity described by `config`.
    #[must_use]
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new(&config.stream, &config.group, &config.consumer)
    }
}

pub use dead_letter::{DeadLetterPolicy, FailureOutcome};
pub use group::{ensure_group, ensure_group_with_retry};
pub use metrics::{MetricsError, MetricsServer};
pub use monitor::{DlqDepth, DlqMonitor};
pub use processor::{MessageProcessor, ProcessOutcome};
pub use reclaimer::{ReclaimReport, Reclaimer};
pub use retry::RetryPolicy;
pub use shutdown::StopSignal;
pub use subscription::{IterationReport, Subscription, SubscriptionBuilder, SubscriptionHandle, fetch};
