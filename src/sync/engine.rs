//! Provider-agnostic sync passes with per-pair state, cursor safety, and
//! failure backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::bridge::{ChangeKind, EventBridge, RemoteEvent};
use crate::client::ApiClient;
use crate::db::schema::SyncStatus;
use crate::events::EventBus;
use crate::index::Indexer;

use super::cache::{CacheEntry, CacheStore};
use super::collection::{PageRequest, RemoteCollection, RemoteItem};
use super::state::SyncStateStore;
use super::SyncError;

/// Consecutive failed passes before a pair is marked degraded.
const DEGRADED_THRESHOLD: i64 = 3;

/// Per-pair retry backoff after a failed pass.
const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_MAX_SECS: u64 = 900;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub fetched: usize,
    pub applied: usize,
    pub cursor: Option<String>,
}

struct PairState {
    running: bool,
    cancelled: Arc<AtomicBool>,
    next_retry_at: Option<Instant>,
}

impl Default for PairState {
    fn default() -> Self {
        Self {
            running: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            next_retry_at: None,
        }
    }
}

enum PassMode {
    Full,
    Incremental,
}

/// Drives [`RemoteCollection`] implementations through paged passes.
///
/// One pass per (account, collection) pair at a time; a concurrent request
/// for a running pair gets [`SyncError::AlreadyInProgress`]. The persisted
/// cursor only advances after a pass applies cleanly end to end.
pub struct SyncEngine {
    cache: CacheStore,
    states: SyncStateStore,
    bus: EventBus,
    indexer: Option<Arc<Indexer>>,
    bridge: Option<Arc<EventBridge>>,
    pairs: StdMutex<HashMap<(String, String), PairState>>,
}

impl SyncEngine {
    pub fn new(cache: CacheStore, states: SyncStateStore, bus: EventBus) -> Self {
        Self {
            cache,
            states,
            bus,
            indexer: None,
            bridge: None,
            pairs: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<Indexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn with_bridge(mut self, bridge: Arc<EventBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn states(&self) -> &SyncStateStore {
        &self.states
    }

    /// Re-fetch the collection from scratch: existing rows are dropped and
    /// the cursor lands at the pass start time.
    pub async fn full_sync(
        &self,
        client: &ApiClient,
        account_id: &str,
        collection: &dyn RemoteCollection,
    ) -> Result<SyncReport, SyncError> {
        self.run_pass(client, account_id, collection, PassMode::Full)
            .await
    }

    /// Fetch only items modified since the stored cursor and merge them
    /// through the replace-on-newer rule.
    pub async fn incremental_sync(
        &self,
        client: &ApiClient,
        account_id: &str,
        collection: &dyn RemoteCollection,
    ) -> Result<SyncReport, SyncError> {
        self.run_pass(client, account_id, collection, PassMode::Incremental)
            .await
    }

    /// Whether the scheduler should attempt this pair now. False while a
    /// pass is running or a failure backoff is pending. Explicit manual
    /// syncs ignore this and run anyway.
    pub fn should_sync(&self, account_id: &str, collection_key: &str) -> bool {
        let pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        match pairs.get(&(account_id.to_string(), collection_key.to_string())) {
            None => true,
            Some(pair) => {
                !pair.running
                    && pair
                        .next_retry_at
                        .map(|at| at <= Instant::now())
                        .unwrap_or(true)
            }
        }
    }

    /// Flag every in-flight pass for the account. Running passes stop at the
    /// next page boundary without advancing their cursor.
    pub fn cancel_account(&self, account_id: &str) {
        let mut pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        for ((pair_account, collection), pair) in pairs.iter_mut() {
            if pair_account == account_id {
                if pair.running {
                    tracing::info!("Cancelling sync of {} for account {}", collection, account_id);
                    pair.cancelled.store(true, Ordering::SeqCst);
                }
                pair.next_retry_at = None;
            }
        }
    }

    async fn run_pass(
        &self,
        client: &ApiClient,
        account_id: &str,
        collection: &dyn RemoteCollection,
        mode: PassMode,
    ) -> Result<SyncReport, SyncError> {
        let key = collection.key();
        let cancelled = self.begin_pass(account_id, &key)?;

        self.states
            .set_status(account_id, &key, SyncStatus::Syncing)
            .await?;
        self.bus.emit(
            "sync:started",
            serde_json::json!({ "account_id": account_id, "collection": key }),
        );

        let result = self
            .execute_pass(client, account_id, collection, &key, &mode, &cancelled)
            .await;

        match &result {
            Ok(report) => {
                self.states
                    .record_success(account_id, &key, report.cursor.as_deref())
                    .await?;
                self.clear_backoff(account_id, &key);
                tracing::info!(
                    "Synced {} for account {}: {} fetched, {} applied",
                    key,
                    account_id,
                    report.fetched,
                    report.applied
                );
                self.bus.emit(
                    "sync:completed",
                    serde_json::json!({
                        "account_id": account_id,
                        "collection": key,
                        "fetched": report.fetched,
                        "applied": report.applied,
                    }),
                );
            }
            Err(SyncError::Cancelled { .. }) => {
                // Aborted, not failed: no streak bump, no backoff. Partial
                // cache writes stay (replace-on-newer makes them safe) but
                // the cursor has not moved.
                self.states
                    .set_status(account_id, &key, SyncStatus::Pending)
                    .await?;
            }
            Err(e) => {
                let streak = self
                    .states
                    .record_failure(account_id, &key, SyncStatus::Error, &e.to_string())
                    .await?;
                tracing::warn!(
                    "Sync of {} for account {} failed (streak {}): {}",
                    key,
                    account_id,
                    streak,
                    e
                );
                self.set_backoff(account_id, &key, streak);
                self.bus.emit(
                    "sync:failed",
                    serde_json::json!({
                        "account_id": account_id,
                        "collection": key,
                        "error": e.to_string(),
                        "consecutive_failures": streak,
                    }),
                );
                if streak >= DEGRADED_THRESHOLD {
                    self.states
                        .set_status(account_id, &key, SyncStatus::Degraded)
                        .await?;
                    self.bus.emit(
                        "sync:degraded",
                        serde_json::json!({
                            "account_id": account_id,
                            "collection": key,
                            "consecutive_failures": streak,
                        }),
                    );
                }
            }
        }

        self.end_pass(account_id, &key);
        result
    }

    async fn execute_pass(
        &self,
        client: &ApiClient,
        account_id: &str,
        collection: &dyn RemoteCollection,
        key: &str,
        mode: &PassMode,
        cancelled: &AtomicBool,
    ) -> Result<SyncReport, SyncError> {
        let started_at = chrono::Utc::now().timestamp_millis();

        let previous = match mode {
            PassMode::Full => {
                self.cache.clear_collection(account_id, key).await?;
                None
            }
            PassMode::Incremental => self.states.cursor(account_id, key).await?,
        };

        let mut page_cursor: Option<String> = None;
        let mut all_items: Vec<RemoteItem> = Vec::new();
        let mut applied = 0usize;

        loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled {
                    account_id: account_id.to_string(),
                    collection: key.to_string(),
                });
            }

            let request = PageRequest {
                page_cursor: page_cursor.as_deref(),
                modified_since: previous.as_deref(),
                page_size: DEFAULT_PAGE_SIZE,
            };

            let page = collection
                .fetch_page(client, account_id, request)
                .await
                .map_err(|source| SyncError::Client {
                    account_id: account_id.to_string(),
                    collection: key.to_string(),
                    source,
                })?;

            // A cancel may land while the fetch is in flight; discard the
            // page rather than applying it.
            if cancelled.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled {
                    account_id: account_id.to_string(),
                    collection: key.to_string(),
                });
            }

            for item in &page.items {
                applied += usize::from(self.apply_item(account_id, key, item).await?);
            }

            all_items.extend(page.items);

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }

        let cursor = match mode {
            PassMode::Full => Some(started_at.to_string()),
            PassMode::Incremental => collection.next_sync_cursor(&all_items, previous.as_deref()),
        };

        Ok(SyncReport {
            fetched: all_items.len(),
            applied,
            cursor,
        })
    }

    /// Apply one fetched item: cache upsert, then index and automation
    /// fan-out for applied changes. Returns whether the cache changed.
    async fn apply_item(
        &self,
        account_id: &str,
        key: &str,
        item: &RemoteItem,
    ) -> Result<bool, SyncError> {
        let entry = CacheEntry {
            account_id: account_id.to_string(),
            collection: key.to_string(),
            remote_id: item.id.clone(),
            kind: item.kind.clone(),
            title: item.title.clone(),
            body: item.body.clone(),
            url: item.url.clone(),
            author_id: item.author_id.clone(),
            parent_id: item.parent_id.clone(),
            last_modified: item.last_modified,
            metadata: item.metadata.as_ref().map(|v| v.to_string()),
        };

        let existed = if self.bridge.is_some() {
            self.cache.get(account_id, key, &item.id).await?.is_some()
        } else {
            false
        };

        let changed = self.cache.upsert(&entry).await?;
        if !changed {
            return Ok(false);
        }

        if let Some(indexer) = &self.indexer {
            indexer.index_entry(&entry).await;
        }

        if let Some(bridge) = &self.bridge {
            let event = RemoteEvent {
                account_id: entry.account_id.clone(),
                collection: entry.collection.clone(),
                remote_id: entry.remote_id.clone(),
                change: if existed {
                    ChangeKind::Updated
                } else {
                    ChangeKind::Created
                },
                entry,
            };
            bridge.on_remote_event(&event).await;
        }

        Ok(true)
    }

    /// Claim the pair for one pass. Returns the cancellation flag the pass
    /// must poll.
    fn begin_pass(&self, account_id: &str, key: &str) -> Result<Arc<AtomicBool>, SyncError> {
        let mut pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        let pair = pairs
            .entry((account_id.to_string(), key.to_string()))
            .or_default();

        if pair.running {
            return Err(SyncError::AlreadyInProgress {
                account_id: account_id.to_string(),
                collection: key.to_string(),
            });
        }

        pair.running = true;
        pair.cancelled = Arc::new(AtomicBool::new(false));
        Ok(pair.cancelled.clone())
    }

    fn end_pass(&self, account_id: &str, key: &str) {
        let mut pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pair) = pairs.get_mut(&(account_id.to_string(), key.to_string())) {
            pair.running = false;
        }
    }

    fn set_backoff(&self, account_id: &str, key: &str, streak: i64) {
        let exponent = streak.clamp(1, 32) as u32 - 1;
        let delay = BACKOFF_BASE_SECS
            .saturating_mul(1u64 << exponent.min(10))
            .min(BACKOFF_MAX_SECS);

        let mut pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pair) = pairs.get_mut(&(account_id.to_string(), key.to_string())) {
            pair.next_retry_at = Some(Instant::now() + Duration::from_secs(delay));
        }
    }

    fn clear_backoff(&self, account_id: &str, key: &str) {
        let mut pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pair) = pairs.get_mut(&(account_id.to_string(), key.to_string())) {
            pair.next_retry_at = None;
        }
    }
}
