//! In-process pub/sub for lifecycle and remote-event notifications.
//!
//! Handlers are registered during initialization and return a disposer
//! handle; collecting those handles in a [`SubscriptionRegistry`] gives the
//! host one place to tear everything down deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Handler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, Handler)>>,
}

/// Topic-keyed event bus. Emission is synchronous and in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic. Dropping (or disposing) the returned
    /// subscription unregisters it.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic: topic.to_string(),
            id,
        }
    }

    /// Dispatch happens outside the bus lock, so handlers are free to
    /// subscribe, emit, or dispose on this same bus.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) {
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.topics.get(topic) {
                Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };

        tracing::trace!("Emitting {} to {} subscriber(s)", topic, handlers.len());
        for handler in &handlers {
            handler(&payload);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.topics.get(topic).map(|h| h.len()).unwrap_or(0)
    }
}

/// Disposer handle for one registered handler.
pub struct Subscription {
    bus: std::sync::Weak<Mutex<BusInner>>,
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn dispose(self) {
        // Drop impl does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut inner = bus.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handlers) = inner.topics.get_mut(&self.topic) {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Collects subscriptions made during initialization so teardown happens in
/// one place instead of scattered through constructors.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Drop every registered handler.
    pub fn dispose_all(&mut self) {
        self.subscriptions.clear();
    }
}
