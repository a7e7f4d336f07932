//! Process-wide publish/subscribe for test-run events.
//!
//! Delivery is synchronous on the publishing thread: every subscriber has
//! run by the time `publish` returns. The engine does not depend on the bus
//! for correctness; it exists for observers such as a UI or a results logger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::measurement::MeasurementResult;
use crate::results::ResultCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Start,
    Step,
    Result,
    Stop,
}

impl SignalKind {
    pub fn identifier(self) -> &'static str {
        match self {
            SignalKind::Start => "TestRun.start",
            SignalKind::Step => "TestRun.step",
            SignalKind::Result => "TestRun.result",
            SignalKind::Stop => "TestRun.stop",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Signal {
    Start { position: usize },
    Step { position: usize, name: String },
    Result(MeasurementResult),
    /// `code` is `None` when the run was stopped before producing a verdict.
    Stop { position: usize, code: Option<ResultCode> },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Start { .. } => SignalKind::Start,
            Signal::Step { .. } => SignalKind::Step,
            Signal::Result(_) => SignalKind::Result,
            Signal::Stop { .. } => SignalKind::Stop,
        }
    }
}

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&Signal) + Send + Sync>;

pub struct SignalBus {
    subscribers: Mutex<Vec<(SubscriptionId, SignalKind, Handler)>>,
    next_id: AtomicU64,
}

static GLOBAL: Lazy<Arc<SignalBus>> = Lazy::new(|| Arc::new(SignalBus::new()));

impl SignalBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The process-wide bus.
    pub fn global() -> Arc<SignalBus> {
        Arc::clone(&GLOBAL)
    }

    pub fn subscribe<F>(&self, kind: SignalKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, kind, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _, _)| *sid != id);
        subscribers.len() != before
    }

    /// Deliver `signal` to every matching subscriber; returns how many ran.
    pub fn publish(&self, signal: &Signal) -> usize {
        let kind = signal.kind();
        // Handlers run outside the lock so they may subscribe or publish.
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        for handler in &handlers {
            handler(signal);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
