//! Pending-sync queue for offline operation.
//!
//! Pairs that cannot sync right now (no connectivity, throttled provider)
//! are queued and drained once conditions recover. One entry per (account,
//! collection) pair; re-queues after failure are bounded.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const DEFAULT_MAX_REQUEUES: u32 = 3;

/// A deferred sync of one (account, collection) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: String,
    pub account_id: String,
    pub collection: String,
    pub created_at: i64,
    pub retry_count: u32,
}

impl SyncRequest {
    pub fn new(account_id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            collection: collection.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
        }
    }

    fn same_pair(&self, other: &SyncRequest) -> bool {
        self.account_id == other.account_id && self.collection == other.collection
    }
}

pub struct SyncQueue {
    queue: Mutex<VecDeque<SyncRequest>>,
    max_requeues: u32,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::with_max_requeues(DEFAULT_MAX_REQUEUES)
    }

    pub fn with_max_requeues(max_requeues: u32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_requeues,
        }
    }

    /// Queue a request unless the pair is already pending.
    pub async fn enqueue(&self, request: SyncRequest) {
        let mut queue = self.queue.lock().await;
        if !queue.iter().any(|pending| pending.same_pair(&request)) {
            queue.push_back(request);
            tracing::info!("Sync request queued, total pending: {}", queue.len());
        }
    }

    pub async fn dequeue(&self) -> Option<SyncRequest> {
        self.queue.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn pending(&self) -> Vec<SyncRequest> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Put a failed request back, unless it has exhausted its re-queues.
    pub async fn requeue_failed(&self, mut request: SyncRequest) -> bool {
        request.retry_count += 1;
        if request.retry_count > self.max_requeues {
            tracing::warn!(
                "Dropping sync request for {}:{} after {} attempts",
                request.account_id,
                request.collection,
                request.retry_count
            );
            return false;
        }

        self.queue.lock().await.push_back(request);
        true
    }

    /// Drain the queue through `processor`, re-queuing failures. Returns
    /// (successes, failures) for the drained snapshot.
    pub async fn process_all<F, Fut>(&self, mut processor: F) -> (usize, usize)
    where
        F: FnMut(SyncRequest) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let mut successes = 0;
        let mut failures = 0;

        // Only drain what was pending at the start, so a persistently
        // failing pair cannot spin this loop forever.
        let mut remaining = self.len().await;
        while remaining > 0 {
            remaining -= 1;
            let Some(request) = self.dequeue().await else {
                break;
            };

            match processor(request.clone()).await {
                Ok(()) => successes += 1,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "Queued sync of {}:{} failed: {}",
                        request.account_id,
                        request.collection,
                        e
                    );
                    self.requeue_failed(request).await;
                }
            }
        }

        (successes, failures)
    }

    /// Drop every pending request for the account, used on disconnect.
    pub async fn remove_account(&self, account_id: &str) {
        let mut queue = self.queue.lock().await;
        queue.retain(|request| request.account_id != account_id);
    }

    pub async fn clear(&self) {
        self.queue.lock().await.clear();
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}
