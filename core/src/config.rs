//! Consumer configuration.
//!
//! Provides environment-based configuration with validation and sensible
//! defaults for every knob of a subscription.
//!
//! # Defaults
//!
//! | setting               | default        | env var                        |
//! |-----------------------|----------------|--------------------------------|
//! | `stream`              | `events`       | `RELAY_STREAM`                 |
//! | `group`               | `relay`        | `RELAY_GROUP`                  |
//! | `consumer`            | `<host>-<pid>` | `RELAY_CONSUMER`               |
//! | `dlq_stream`          | `events:dlq`   | `RELAY_DLQ_STREAM`             |
//! | `start_offset`        | beginning      | `RELAY_START_OFFSET`           |
//! | `max_retries`         | 3              | `RELAY_MAX_RETRIES`            |
//! | `batch_size`          | 10             | `RELAY_BATCH_SIZE`             |
//! | `block_timeout_ms`    | 5000           | `RELAY_BLOCK_TIMEOUT_MS`       |
//! | `idle_threshold_ms`   | 60000          | `RELAY_IDLE_THRESHOLD_MS`      |
//! | `max_claim`           | 10             | `RELAY_MAX_CLAIM`              |
//! | `error_backoff_ms`    | 1000           | `RELAY_ERROR_BACKOFF_MS`       |
//! | `dlq_alert_threshold` | 50             | `RELAY_DLQ_ALERT_THRESHOLD`    |
//! | `dlq_check_interval_ms` | 30000        | `RELAY_DLQ_CHECK_INTERVAL_MS`  |
//!
//! # Example
//!
//! ```
//! use relay_core::config::ConsumerConfig;
//!
//! let config = ConsumerConfig::builder()
//!     .stream("approvals")
//!     .group("notifier")
//!     .consumer("notifier-1")
//!     .max_retries(5)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.batch_size, 10);
//! assert_eq!(config.block_timeout().as_millis(), 5000);
//! ```

use crate::entry::StartOffset;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is set but cannot be parsed
    #[error("Invalid value for {var}: {value}")]
    EnvVarInvalid {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Settings for one subscription (one stream, one consumer identity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Stream to consume
    pub stream: String,
    /// Consumer group name
    pub group: String,
    /// Consumer name within the group
    pub consumer: String,
    /// Stream receiving dead-letter records
    pub dlq_stream: String,
    /// Where a newly created group starts reading
    pub start_offset: StartOffset,
    /// Deliveries allowed before an entry is dead-lettered
    pub max_retries: u64,
    /// Maximum entries fetched per read
    pub batch_size: usize,
    /// Maximum time a read blocks waiting for new entries, in milliseconds
    pub block_timeout_ms: u64,
    /// Idle time after which a pending entry may be reclaimed, in milliseconds
    pub idle_threshold_ms: u64,
    /// Maximum entries claimed per reclaim pass
    pub max_claim: usize,
    /// Sleep after a failed loop iteration, in milliseconds
    pub error_backoff_ms: u64,
    /// Dead-letter depth above which an alert is raised
    pub dlq_alert_threshold: u64,
    /// Interval between dead-letter depth checks, in milliseconds
    pub dlq_check_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream: "events".to_string(),
            group: "relay".to_string(),
            consumer: default_consumer_name(),
            dlq_stream: "events:dlq".to_string(),
            start_offset: StartOffset::Beginning,
            max_retries: 3,
            batch_size: 10,
            block_timeout_ms: 5_000,
            idle_threshold_ms: 60_000,
            max_claim: 10,
            error_backoff_ms: 1_000,
            dlq_alert_threshold: 50,
            dlq_check_interval_ms: 30_000,
        }
    }
}

/// `<hostname>-<pid>`, falling back to `relay-<pid>`.
#[must_use]
pub fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "relay".to_string());
    format!("{host}-{}", std::process::id())
}

impl ConsumerConfig {
    /// Create a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load configuration from `RELAY_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvVarInvalid`] if a variable cannot be parsed,
    /// or [`ConfigError::ValidationError`] if the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`ConsumerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("RELAY_STREAM") {
            config.stream = v;
        }
        if let Some(v) = lookup("RELAY_GROUP") {
            config.group = v;
        }
        if let Some(v) = lookup("RELAY_CONSUMER") {
            config.consumer = v;
        }
        if let Some(v) = lookup("RELAY_DLQ_STREAM") {
            config.dlq_stream = v;
        }
        if let Some(v) = lookup("RELAY_START_OFFSET") {
            config.start_offset = v.parse().map_err(|_| ConfigError::EnvVarInvalid {
                var: "RELAY_START_OFFSET",
                value: v.clone(),
            })?;
        }
        parse_var(&lookup, "RELAY_MAX_RETRIES", &mut config.max_retries)?;
        parse_var(&lookup, "RELAY_BATCH_SIZE", &mut config.batch_size)?;
        parse_var(&lookup, "RELAY_BLOCK_TIMEOUT_MS", &mut config.block_timeout_ms)?;
        parse_var(&lookup, "RELAY_IDLE_THRESHOLD_MS", &mut config.idle_threshold_ms)?;
        parse_var(&lookup, "RELAY_MAX_CLAIM", &mut config.max_claim)?;
        parse_var(&lookup, "RELAY_ERROR_BACKOFF_MS", &mut config.error_backoff_ms)?;
        parse_var(&lookup, "RELAY_DLQ_ALERT_THRESHOLD", &mut config.dlq_alert_threshold)?;
        parse_var(&lookup, "RELAY_DLQ_CHECK_INTERVAL_MS", &mut config.dlq_check_interval_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("stream", &self.stream),
            ("group", &self.group),
            ("consumer", &self.consumer),
            ("dlq_stream", &self.dlq_stream),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{name} cannot be empty")));
            }
        }
        if self.dlq_stream == self.stream {
            return Err(ConfigError::ValidationError(
                "dlq_stream must differ from stream".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ValidationError("max_retries must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationError("batch_size must be > 0".to_string()));
        }
        if self.max_claim == 0 {
            return Err(ConfigError::ValidationError("max_claim must be > 0".to_string()));
        }
        if self.dlq_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dlq_check_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy of this configuration for another stream.
    #[must_use]
    pub fn for_stream(&self, stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            ..self.clone()
        }
    }

    /// Read block timeout as Duration
    #[must_use]
    pub const fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Reclaim idle threshold as Duration
    #[must_use]
    pub const fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    /// Error backoff as Duration
    #[must_use]
    pub const fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Dead-letter check interval as Duration
    #[must_use]
    pub const fn dlq_check_interval(&self) -> Duration {
        Duration::from_millis(self.dlq_check_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(var) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::EnvVarInvalid { var, value: raw.clone() })?;
    }
    Ok(())
}

/// Builder for [`ConsumerConfig`].
#[derive(Debug, Clone)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Set the stream name.
    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.config.stream = stream.into();
        self
    }

    /// Set the consumer group name.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Set the consumer name.
    #[must_use]
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.config.consumer = consumer.into();
        self
    }

    /// Set the dead-letter stream name.
    #[must_use]
    pub fn dlq_stream(mut self, dlq_stream: impl Into<String>) -> Self {
        self.config.dlq_stream = dlq_stream.into();
        self
    }

    /// Set where a newly created group starts reading.
    #[must_use]
    pub const fn start_offset(mut self, start_offset: StartOffset) -> Self {
        self.config.start_offset = start_offset;
        self
    }

    /// Set deliveries allowed before dead-lettering.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u64) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Set the fetch batch size.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set the read block timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn block_timeout(mut self, timeout: Duration) -> Self {
        self.config.block_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the reclaim idle threshold.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn idle_threshold(mut self, threshold: Duration) -> Self {
        self.config.idle_threshold_ms = threshold.as_millis() as u64;
        self
    }

    /// Set the maximum entries claimed per reclaim pass.
    #[must_use]
    pub const fn max_claim(mut self, max_claim: usize) -> Self {
        self.config.max_claim = max_claim;
        self
    }

    /// Set the sleep after a failed loop iteration.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the dead-letter depth alert threshold.
    #[must_use]
    pub const fn dlq_alert_threshold(mut self, threshold: u64) -> Self {
        self.config.dlq_alert_threshold = threshold;
        self
    }

    /// Set the dead-letter depth check interval.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn dlq_check_interval(mut self, interval: Duration) -> Self {
        self.config.dlq_check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Validate and build the [`ConsumerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is invalid.
    pub fn build(self) -> Result<ConsumerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
