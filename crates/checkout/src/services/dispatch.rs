//! Fire-and-forget side-effect dispatch.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::ServiceError;

/// Where a post-commit side effect goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideEffectChannel {
    Notification,
    Webhook,
    Audit,
}

impl SideEffectChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectChannel::Notification => "notification",
            SideEffectChannel::Webhook => "webhook",
            SideEffectChannel::Audit => "audit",
        }
    }
}

impl std::fmt::Display for SideEffectChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trait for queueing work that must not block order placement.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Queues an event. Returning does not mean the event was delivered.
    async fn enqueue(&self, event: &str, payload: serde_json::Value) -> Result<(), ServiceError>;
}

/// The three dispatch channels an order placement notifies.
#[derive(Debug, Clone, Default)]
pub struct Dispatchers<D> {
    pub notifications: D,
    pub webhooks: D,
    pub audit: D,
}

impl<D: Dispatcher> Dispatchers<D> {
    pub fn new(notifications: D, webhooks: D, audit: D) -> Self {
        Self {
            notifications,
            webhooks,
            audit,
        }
    }

    pub fn channel(&self, channel: SideEffectChannel) -> &D {
        match channel {
            SideEffectChannel::Notification => &self.notifications,
            SideEffectChannel::Webhook => &self.webhooks,
            SideEffectChannel::Audit => &self.audit,
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryDispatcherState {
    events: Vec<(String, serde_json::Value)>,
    fail_on_enqueue: bool,
}

/// Dispatcher that records events in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDispatcher {
    state: Arc<RwLock<InMemoryDispatcherState>>,
}

impl InMemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_enqueue(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_enqueue = fail;
    }

    /// Returns the recorded events in enqueue order.
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }

    pub fn event_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }
}

#[async_trait]
impl Dispatcher for InMemoryDispatcher {
    async fn enqueue(&self, event: &str, payload: serde_json::Value) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.fail_on_enqueue {
            return Err(ServiceError::Unavailable(format!("cannot enqueue {event}")));
        }

        state.events.push((event.to_string(), payload));
        Ok(())
    }
}
