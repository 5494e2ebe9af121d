//! Bridge from remote-data changes to the host shell's automation layer.
//!
//! Sync passes report each applied change as a [`RemoteEvent`]. Registered
//! trigger predicates are evaluated in registration order and every match is
//! forwarded to the [`AutomationSink`] sequentially, so trigger ordering is
//! stable per event. Sink failures are logged and swallowed; automation must
//! never abort a sync pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::CacheEntry;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No action registered under id {0}")]
    UnknownAction(String),

    #[error("Action {id} failed: {message}")]
    ActionFailed { id: String, message: String },

    #[error("Automation sink error: {0}")]
    Sink(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
}

/// One observed change in remote data.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub account_id: String,
    pub collection: String,
    pub remote_id: String,
    pub change: ChangeKind,
    pub entry: CacheEntry,
}

/// The host shell's automation collaborator, invoked once per matched
/// trigger.
#[async_trait]
pub trait AutomationSink: Send + Sync {
    async fn trigger_fired(&self, trigger_id: &str, event: &RemoteEvent) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, config: serde_json::Value) -> Result<serde_json::Value, BridgeError>;
}

type TriggerPredicate = Box<dyn Fn(&RemoteEvent) -> bool + Send + Sync>;

pub struct EventBridge {
    sink: Arc<dyn AutomationSink>,
    /// Registration order is dispatch order.
    triggers: Mutex<Vec<(String, TriggerPredicate)>>,
    actions: Mutex<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl EventBridge {
    pub fn new(sink: Arc<dyn AutomationSink>) -> Self {
        Self {
            sink,
            triggers: Mutex::new(Vec::new()),
            actions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a trigger predicate. A second registration under the same id
    /// replaces the first, keeping its position.
    pub fn register_trigger<F>(&self, id: &str, predicate: F)
    where
        F: Fn(&RemoteEvent) -> bool + Send + Sync + 'static,
    {
        let mut triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = triggers.iter_mut().find(|(existing, _)| existing == id) {
            slot.1 = Box::new(predicate);
        } else {
            triggers.push((id.to_string(), Box::new(predicate)));
        }
    }

    pub fn unregister_trigger(&self, id: &str) -> bool {
        let mut triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        let before = triggers.len();
        triggers.retain(|(existing, _)| existing != id);
        triggers.len() != before
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Evaluate every registered predicate against the event and notify the
    /// sink for each match, one at a time, in registration order.
    pub async fn on_remote_event(&self, event: &RemoteEvent) {
        let matched: Vec<String> = {
            let triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
            triggers
                .iter()
                .filter(|(_, predicate)| predicate(event))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for trigger_id in matched {
            if let Err(e) = self.sink.trigger_fired(&trigger_id, event).await {
                tracing::warn!(
                    "Trigger {} failed on {}:{}: {}",
                    trigger_id,
                    event.collection,
                    event.remote_id,
                    e
                );
            }
        }
    }

    pub fn register_action(&self, id: &str, handler: Arc<dyn ActionHandler>) {
        let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        actions.insert(id.to_string(), handler);
    }

    pub fn unregister_action(&self, id: &str) -> bool {
        let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        actions.remove(id).is_some()
    }

    pub async fn run_action(
        &self,
        id: &str,
        config: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let handler = {
            let actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
            actions
                .get(id)
                .cloned()
                .ok_or_else(|| BridgeError::UnknownAction(id.to_string()))?
        };

        handler.run(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(remote_id: &str, body: &str) -> RemoteEvent {
        let entry = CacheEntry {
            account_id: "acct-1".into(),
            collection: "slack:messages:C1".into(),
            remote_id: remote_id.into(),
            kind: "message".into(),
            title: None,
            body: body.into(),
            url: None,
            author_id: None,
            parent_id: None,
            last_modified: 1000,
            metadata: None,
        };
        RemoteEvent {
            account_id: entry.account_id.clone(),
            collection: entry.collection.clone(),
            remote_id: entry.remote_id.clone(),
            change: ChangeKind::Created,
            entry,
        }
    }

    /// Records trigger ids in arrival order; fails those listed in `fail`.
    struct RecordingSink {
        fired: Mutex<Vec<String>>,
        fail: Vec<String>,
    }

    impl RecordingSink {
        fn new(fail: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fired: Mutex::new(Vec::new()),
                fail: fail.iter().map(|s| s.to_string()).collect(),
            })
        }

        fn fired(&self) -> Vec<String> {
            self.fired.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AutomationSink for RecordingSink {
        async fn trigger_fired(
            &self,
            trigger_id: &str,
            _event: &RemoteEvent,
        ) -> Result<(), BridgeError> {
            self.fired.lock().unwrap().push(trigger_id.to_string());
            if self.fail.iter().any(|f| f == trigger_id) {
                return Err(BridgeError::Sink("boom".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_triggers_fire_in_registration_order() {
        let sink = RecordingSink::new(&[]);
        let bridge = EventBridge::new(sink.clone());

        bridge.register_trigger("second", |_| true);
        bridge.register_trigger("third", |_| true);
        bridge.register_trigger("never", |_| false);

        bridge.on_remote_event(&event("m1", "hello")).await;
        assert_eq!(sink.fired(), vec!["second", "third"]);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_later_triggers() {
        let sink = RecordingSink::new(&["a"]);
        let bridge = EventBridge::new(sink.clone());

        bridge.register_trigger("a", |_| true);
        bridge.register_trigger("b", |_| true);

        bridge.on_remote_event(&event("m1", "hello")).await;
        assert_eq!(sink.fired(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_predicate_sees_event_content() {
        let sink = RecordingSink::new(&[]);
        let bridge = EventBridge::new(sink.clone());

        bridge.register_trigger("mentions-deploy", |e| e.entry.body.contains("deploy"));

        bridge.on_remote_event(&event("m1", "lunch plans")).await;
        bridge.on_remote_event(&event("m2", "deploy at 5")).await;

        assert_eq!(sink.fired(), vec!["mentions-deploy"]);
    }

    #[tokio::test]
    async fn test_unregister_trigger() {
        let sink = RecordingSink::new(&[]);
        let bridge = EventBridge::new(sink.clone());

        bridge.register_trigger("t", |_| true);
        assert!(bridge.unregister_trigger("t"));
        assert!(!bridge.unregister_trigger("t"));

        bridge.on_remote_event(&event("m1", "x")).await;
        assert!(sink.fired().is_empty());
    }

    #[tokio::test]
    async fn test_reregistering_trigger_keeps_position() {
        let sink = RecordingSink::new(&[]);
        let bridge = EventBridge::new(sink.clone());

        bridge.register_trigger("a", |_| true);
        bridge.register_trigger("b", |_| true);
        bridge.register_trigger("a", |_| true);
        assert_eq!(bridge.trigger_count(), 2);

        bridge.on_remote_event(&event("m1", "x")).await;
        assert_eq!(sink.fired(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_run_action() {
        struct Echo(AtomicUsize);

        #[async_trait]
        impl ActionHandler for Echo {
            async fn run(&self, config: serde_json::Value) -> Result<serde_json::Value, BridgeError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(config)
            }
        }

        let sink = RecordingSink::new(&[]);
        let bridge = EventBridge::new(sink);
        let echo = Arc::new(Echo(AtomicUsize::new(0)));
        bridge.register_action("echo", echo.clone());

        let out = bridge
            .run_action("echo", serde_json::json!({"k": 1}))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"k": 1}));
        assert_eq!(echo.0.load(Ordering::SeqCst), 1);

        let missing = bridge.run_action("ghost", serde_json::Value::Null).await;
        assert!(matches!(missing, Err(BridgeError::UnknownAction(_))));
    }
}
