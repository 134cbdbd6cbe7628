//! Event handlers and the per-kind dispatch table.
//!
//! Business logic plugs into the consumer by registering one [`EventHandler`]
//! per [`EventKind`] in a [`HandlerRegistry`]. The registry is the capability
//! table the message processor consults for every decoded envelope.
//!
//! # Example
//!
//! ```
//! use relay_core::envelope::EventKind;
//! use relay_core::handler::{handler_fn, HandlerError, HandlerRegistry};
//!
//! let registry = HandlerRegistry::new()
//!     .on(EventKind::TaskAssigned, handler_fn(|envelope| async move {
//!         if envelope.payload.get("task_id").is_none() {
//!             return Err(HandlerError::Rejected("task_id missing".into()));
//!         }
//!         Ok(())
//!     }));
//!
//! assert!(registry.handler_for(EventKind::TaskAssigned).is_some());
//! assert!(registry.handler_for(EventKind::AuditRecorded).is_none());
//! ```

use crate::envelope::{EnvelopeError, EventEnvelope, EventKind};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// A business rule rejected the event
    #[error("rejected: {0}")]
    Rejected(String),

    /// A downstream dependency was unavailable
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Any other failure
    #[error("failed: {0}")]
    Other(String),
}

/// Boxed future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Caller-supplied processing logic for one kind of event.
///
/// Handlers may be invoked more than once for the same event (at-least-once
/// delivery) and must therefore be idempotent, typically keyed on the
/// envelope's `id` or `correlation_id`.
pub trait EventHandler: Send + Sync {
    /// Process one envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] if the event could not be processed; the
    /// entry then stays pending and is redelivered later.
    fn handle<'a>(&'a self, envelope: &'a EventEnvelope) -> HandlerFuture<'a>;
}

/// Adapter turning an async closure into an [`EventHandler`].
///
/// Created by [`handler_fn`]. The closure receives an owned clone of the envelope.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(&'a self, envelope: &'a EventEnvelope) -> HandlerFuture<'a> {
        Box::pin((self.f)(envelope.clone()))
    }
}

/// Dispatch table from event kind to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous registration.
    #[must_use]
    pub fn on(mut self, kind: EventKind, handler: impl EventHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Register a shared handler for `kind`.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Register the same handler for every kind in `kinds`.
    #[must_use]
    pub fn on_each(mut self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) -> Self {
        for kind in kinds {
            self.handlers.insert(*kind, Arc::clone(&handler));
        }
        self
    }

    /// Handler registered for `kind`, if any.
    #[must_use]
    pub fn handler_for(&self, kind: EventKind) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&kind)
    }

    /// Kinds with a registered handler, in declaration order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Why processing an entry did not succeed.
///
/// All variants take the same retry / dead-letter path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingFailure {
    /// The entry could not be decoded into a valid envelope
    #[error("invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    /// No handler is registered for the envelope's kind
    #[error("no handler registered for event type '{0}'")]
    NoHandler(EventKind),

    /// The handler returned an error
    #[error("handler {0}")]
    Handler(#[from] HandlerError),
}

impl ProcessingFailure {
    /// Short, low-cardinality reason used as a metric label.
    #[must_use]
    pub const fn reason_prefix(&self) -> &'static str {
        match self {
            Self::Envelope(EnvelopeError::MissingEventField | EnvelopeError::MissingField(_)) => {
                "envelope_missing_field"
            },
            Self::Envelope(EnvelopeError::MalformedJson(_)) => "envelope_malformed",
            Self::Envelope(EnvelopeError::UnknownEventType(_)) => "envelope_unknown_type",
            Self::Envelope(EnvelopeError::InvalidTimestamp { .. }) => "envelope_bad_timestamp",
            Self::NoHandler(_) => "no_handler",
            Self::Handler(HandlerError::Rejected(_)) => "handler_rejected",
            Self::Handler(HandlerError::Unavailable(_)) => "handler_unavailable",
            Self::Handler(HandlerError::Other(_)) => "handler_failed",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(kind: EventKind) -> EventEnvelope {
        EventEnvelope::new("evt-1", kind, "corr-1", serde_json::json!({}), Utc::now())
    }

    #[tokio::test]
    async fn fn_handler_receives_envelope() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler = handler_fn(move |env: EventEnvelope| {
            let seen = Arc::clone(&seen);
            async move {
                assert_eq!(env.kind, EventKind::StatusChanged);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handler.handle(&envelope(EventKind::StatusChanged)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_dispatches_by_kind() {
        let shared: Arc<dyn EventHandler> = Arc::new(handler_fn(|_| async { Ok(()) }));
        let registry = HandlerRegistry::new().on_each(
            &[EventKind::RequestApproved, EventKind::RequestRejected],
            shared,
        );

        assert_eq!(
            registry.kinds(),
            vec![EventKind::RequestApproved, EventKind::RequestRejected]
        );
        assert!(registry.handler_for(EventKind::RequestCreated).is_none());
    }

    #[test]
    fn reason_prefixes_are_stable() {
        assert_eq!(
            ProcessingFailure::from(EnvelopeError::MalformedJson("x".into())).reason_prefix(),
            "envelope_malformed"
        );
        assert_eq!(
            ProcessingFailure::NoHandler(EventKind::AuditRecorded).reason_prefix(),
            "no_handler"
        );
        assert_eq!(
            ProcessingFailure::from(HandlerError::Unavailable("db".into())).reason_prefix(),
            "handler_unavailable"
        );
    }

    #[test]
    fn failure_messages_include_cause() {
        let failure = ProcessingFailure::from(HandlerError::Rejected("quota exceeded".into()));
        assert_eq!(failure.to_string(), "handler rejected: quota exceeded");
    }
}
