//! Scripted event handlers.
//!
//! Each handler is cheap to clone; clones share their recorded state so the
//! test can keep one handle while the registry owns another.

use relay_core::envelope::EventEnvelope;
use relay_core::handler::{EventHandler, HandlerError, HandlerFuture};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, Semaphore};

/// Handler that accepts every envelope and remembers it.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl RecordingHandler {
    /// Create a handler with an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelopes handled so far, in call order.
    #[must_use]
    pub fn received(&self) -> Vec<EventEnvelope> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Event ids handled so far, in call order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.received().into_iter().map(|e| e.id).collect()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl EventHandler for RecordingHandler {
    fn handle<'a>(&'a self, envelope: &'a EventEnvelope) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.received
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(envelope.clone());
            Ok(())
        })
    }
}

/// Handler that always fails with the same error.
#[derive(Clone)]
pub struct FailingHandler {
    error: HandlerError,
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    /// Fail every call with `error`.
    #[must_use]
    pub fn new(error: HandlerError) -> Self {
        Self {
            error,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventHandler for FailingHandler {
    fn handle<'a>(&'a self, _envelope: &'a EventEnvelope) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        })
    }
}

/// Handler that fails its first `failures` calls, then records successes.
#[derive(Clone)]
pub struct FlakyHandler {
    remaining_failures: Arc<AtomicU32>,
    calls: Arc<AtomicUsize>,
    succeeded: RecordingHandler,
}

impl FlakyHandler {
    /// Fail `failures` times with [`HandlerError::Unavailable`], then succeed.
    #[must_use]
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicU32::new(failures)),
            calls: Arc::new(AtomicUsize::new(0)),
            succeeded: RecordingHandler::new(),
        }
    }

    /// Number of calls so far, failed or not.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Envelopes that were handled successfully.
    #[must_use]
    pub fn succeeded(&self) -> Vec<EventEnvelope> {
        self.succeeded.received()
    }
}

impl EventHandler for FlakyHandler {
    fn handle<'a>(&'a self, envelope: &'a EventEnvelope) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(HandlerError::Unavailable("downstream not ready".into()));
            }
            self.succeeded.handle(envelope).await
        })
    }
}

/// Handler that parks every call until the test releases it.
///
/// Used to hold a handler in flight while the test stops the consumer.
#[derive(Clone)]
pub struct BlockingHandler {
    gate: Arc<Semaphore>,
    started: Arc<Notify>,
    finished: RecordingHandler,
}

impl Default for BlockingHandler {
    fn default() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            started: Arc::new(Notify::new()),
            finished: RecordingHandler::new(),
        }
    }
}

impl BlockingHandler {
    /// Create a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a call has entered the handler.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let `calls` parked or future calls through.
    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    /// Envelopes whose calls completed.
    #[must_use]
    pub fn finished(&self) -> Vec<EventEnvelope> {
        self.finished.received()
    }
}

impl EventHandler for BlockingHandler {
    fn handle<'a>(&'a self, envelope: &'a EventEnvelope) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.started.notify_one();
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| HandlerError::Other(e.to_string()))?;
            permit.forget();
            self.finished.handle(envelope).await
        })
    }
}
