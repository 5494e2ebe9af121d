//! Scheduled background syncing of every registered (account, collection)
//! pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::client::ApiClient;
use crate::db::Database;
use crate::events::EventBus;

use super::collection::RemoteCollection;
use super::engine::SyncEngine;
use super::SyncError;

pub const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 15;

/// Collection passes running at once across all pairs.
const MAX_CONCURRENT_SYNCS: usize = 2;

const SYNC_INTERVAL_PREF_KEY: &str = "sync_interval_minutes";

/// One schedulable pair: the account, its provider's client, and the
/// collection to pull.
#[derive(Clone)]
pub struct RegisteredPair {
    pub account_id: String,
    pub client: Arc<ApiClient>,
    pub collection: Arc<dyn RemoteCollection>,
}

/// Interval-driven sync loop over the registered pairs.
///
/// Each cycle attempts an incremental pass for every pair the engine says is
/// due; pairs in failure backoff or already running are skipped. A
/// semaphore caps concurrent passes.
pub struct BackgroundSyncService {
    engine: Arc<SyncEngine>,
    bus: EventBus,
    pairs: Arc<Mutex<Vec<RegisteredPair>>>,
    interval_minutes: u64,
    is_running: Arc<Mutex<bool>>,
    /// Bumped on every start; a superseded loop sees the mismatch on its
    /// next wake and exits.
    generation: Arc<AtomicU64>,
    semaphore: Arc<Semaphore>,
}

impl BackgroundSyncService {
    pub fn new(engine: Arc<SyncEngine>, bus: EventBus, interval_minutes: u64) -> Self {
        Self {
            engine,
            bus,
            pairs: Arc::new(Mutex::new(Vec::new())),
            interval_minutes,
            is_running: Arc::new(Mutex::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_SYNCS)),
        }
    }

    pub async fn register_pair(&self, pair: RegisteredPair) {
        let key = pair.collection.key();
        let mut pairs = self.pairs.lock().await;
        pairs.retain(|existing| {
            !(existing.account_id == pair.account_id && existing.collection.key() == key)
        });
        pairs.push(pair);
    }

    pub async fn remove_account(&self, account_id: &str) {
        let mut pairs = self.pairs.lock().await;
        pairs.retain(|pair| pair.account_id != account_id);
    }

    pub async fn pair_count(&self) -> usize {
        self.pairs.lock().await.len()
    }

    pub async fn get_pair(
        &self,
        account_id: &str,
        collection_key: &str,
    ) -> Option<RegisteredPair> {
        let pairs = self.pairs.lock().await;
        pairs
            .iter()
            .find(|pair| {
                pair.account_id == account_id && pair.collection.key() == collection_key
            })
            .cloned()
    }

    /// Start the interval loop. A second start while running is a no-op.
    pub async fn start(&self) {
        let mut is_running = self.is_running.lock().await;
        if *is_running {
            return;
        }
        *is_running = true;
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(is_running);

        let engine = self.engine.clone();
        let bus = self.bus.clone();
        let pairs = self.pairs.clone();
        let semaphore = self.semaphore.clone();
        let is_running = self.is_running.clone();
        let generation = self.generation.clone();
        let interval = self.interval_minutes;

        tokio::spawn(async move {
            loop {
                {
                    // A quick stop/start can restart the service while
                    // this loop is still asleep; the generation check
                    // retires the old loop instead of letting two tick.
                    let running = is_running.lock().await;
                    if !*running || generation.load(Ordering::SeqCst) != my_generation {
                        break;
                    }
                }

                let snapshot = pairs.lock().await.clone();
                Self::cycle(&engine, &bus, &snapshot, &semaphore).await;
                tokio::time::sleep(Duration::from_secs(interval * 60)).await;
            }
        });
    }

    pub async fn stop(&self) {
        let mut is_running = self.is_running.lock().await;
        *is_running = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.lock().await
    }

    /// Run one cycle immediately, outside the interval schedule.
    pub async fn run_cycle(&self) {
        let snapshot = self.pairs.lock().await.clone();
        Self::cycle(&self.engine, &self.bus, &snapshot, &self.semaphore).await;
    }

    /// Sync one pair right now, ignoring any failure backoff.
    pub async fn sync_now(&self, account_id: &str, collection_key: &str) -> Result<usize, SyncError> {
        let Some(pair) = self.get_pair(account_id, collection_key).await else {
            tracing::warn!("No registered pair {}:{}", account_id, collection_key);
            return Ok(0);
        };

        let report = self
            .engine
            .incremental_sync(&pair.client, &pair.account_id, &*pair.collection)
            .await?;
        Ok(report.applied)
    }

    async fn cycle(
        engine: &Arc<SyncEngine>,
        bus: &EventBus,
        pairs: &[RegisteredPair],
        semaphore: &Arc<Semaphore>,
    ) {
        tracing::info!("Starting sync cycle over {} pair(s)", pairs.len());
        let start = Instant::now();

        let mut handles = Vec::new();
        for pair in pairs {
            if !engine.should_sync(&pair.account_id, &pair.collection.key()) {
                tracing::debug!(
                    "Skipping {}:{} (running or backed off)",
                    pair.account_id,
                    pair.collection.key()
                );
                continue;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let engine = engine.clone();
            let pair = pair.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match engine
                    .incremental_sync(&pair.client, &pair.account_id, &*pair.collection)
                    .await
                {
                    Ok(report) => Ok(report.applied),
                    // A manual sync won the pair; nothing to do.
                    Err(SyncError::AlreadyInProgress { .. }) => Ok(0),
                    Err(e) => Err(format!("{}:{}: {}", pair.account_id, pair.collection.key(), e)),
                }
            }));
        }

        let mut items_applied = 0usize;
        let mut errors = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(applied)) => items_applied += applied,
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(format!("sync task panicked: {}", e)),
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Sync cycle completed: {} item(s) in {}ms, {} error(s)",
            items_applied,
            duration_ms,
            errors.len()
        );
        bus.emit(
            "sync:cycle_completed",
            serde_json::json!({
                "items_applied": items_applied,
                "duration_ms": duration_ms,
                "errors": errors,
            }),
        );
    }
}

/// Sync interval from the preferences table, falling back to the default on
/// missing or unparseable values.
pub async fn load_sync_interval(db: &Database) -> u64 {
    let row: Result<Option<(String,)>, _> =
        sqlx::query_as("SELECT value FROM preferences WHERE key = ?")
            .bind(SYNC_INTERVAL_PREF_KEY)
            .fetch_optional(db.pool())
            .await;

    match row {
        Ok(Some((value,))) => value.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid sync interval preference: {}", value);
            DEFAULT_SYNC_INTERVAL_MINUTES
        }),
        Ok(None) => DEFAULT_SYNC_INTERVAL_MINUTES,
        Err(e) => {
            tracing::warn!("Could not load sync interval preference: {}", e);
            DEFAULT_SYNC_INTERVAL_MINUTES
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{OAuthClient, OAuthConfig, TokenStore};
    use crate::client::ClientError;
    use crate::crypto;
    use crate::db::schema::ProviderKind;
    use crate::sync::{CacheStore, CollectionPage, PageRequest, RemoteItem, SyncStateStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Shared across collections to observe how many fetches overlap.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    struct CountingCollection {
        key: String,
        fetches: AtomicUsize,
        fail: bool,
        delay_ms: u64,
        gauge: Option<Arc<Gauge>>,
    }

    impl CountingCollection {
        fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.into(),
                fetches: AtomicUsize::new(0),
                fail: false,
                delay_ms: 0,
                gauge: None,
            })
        }

        fn failing(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.into(),
                fetches: AtomicUsize::new(0),
                fail: true,
                delay_ms: 0,
                gauge: None,
            })
        }

        fn slow(key: &str, delay_ms: u64, gauge: Arc<Gauge>) -> Arc<Self> {
            Arc::new(Self {
                key: key.into(),
                fetches: AtomicUsize::new(0),
                fail: false,
                delay_ms,
                gauge: Some(gauge),
            })
        }
    }

    #[async_trait]
    impl RemoteCollection for CountingCollection {
        fn key(&self) -> String {
            self.key.clone()
        }

        async fn fetch_page(
            &self,
            _client: &ApiClient,
            _account_id: &str,
            _request: PageRequest<'_>,
        ) -> Result<CollectionPage, ClientError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gauge) = &self.gauge {
                let active = gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(active, Ordering::SeqCst);
            }

            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if let Some(gauge) = &self.gauge {
                gauge.active.fetch_sub(1, Ordering::SeqCst);
            }

            if self.fail {
                return Err(ClientError::Api {
                    status: 500,
                    code: None,
                    message: "broken".into(),
                });
            }

            Ok(CollectionPage {
                items: vec![RemoteItem {
                    id: "m1".into(),
                    kind: "message".into(),
                    title: None,
                    body: "hello".into(),
                    url: None,
                    author_id: None,
                    parent_id: None,
                    last_modified: chrono::Utc::now().timestamp_millis(),
                    metadata: None,
                }],
                next_cursor: None,
            })
        }
    }

    async fn dummy_client() -> Arc<ApiClient> {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let tokens = Arc::new(TokenStore::new(db, Arc::new(crypto::test_service())));
        let oauth = Arc::new(OAuthClient::new(OAuthConfig {
            provider: ProviderKind::Slack,
            client_id: "id".into(),
            client_secret: "secret".into(),
            authorize_url: "https://example.invalid/authorize".into(),
            token_url: "https://example.invalid/token".into(),
            redirect_port: 0,
            authorize_params: vec![],
            use_pkce: false,
        }));
        Arc::new(ApiClient::new("https://example.invalid", tokens, oauth).unwrap())
    }

    async fn service() -> BackgroundSyncService {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let crypto = Arc::new(crypto::test_service());
        let engine = Arc::new(SyncEngine::new(
            CacheStore::new(db.clone(), crypto),
            SyncStateStore::new(db),
            EventBus::new(),
        ));
        BackgroundSyncService::new(engine, EventBus::new(), DEFAULT_SYNC_INTERVAL_MINUTES)
    }

    #[tokio::test]
    async fn test_cycle_syncs_every_registered_pair() {
        let service = service().await;
        let client = dummy_client().await;

        let first = CountingCollection::new("test:c1");
        let second = CountingCollection::new("test:c2");
        service
            .register_pair(RegisteredPair {
                account_id: "a1".into(),
                client: client.clone(),
                collection: first.clone(),
            })
            .await;
        service
            .register_pair(RegisteredPair {
                account_id: "a1".into(),
                client,
                collection: second.clone(),
            })
            .await;

        service.run_cycle().await;

        assert_eq!(first.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(second.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cycle_skips_backed_off_pair() {
        let service = service().await;
        let client = dummy_client().await;

        let failing = CountingCollection::failing("test:c1");
        service
            .register_pair(RegisteredPair {
                account_id: "a1".into(),
                client,
                collection: failing.clone(),
            })
            .await;

        service.run_cycle().await;
        assert_eq!(failing.fetches.load(Ordering::SeqCst), 1);

        // The failure set a retry backoff; the next cycle leaves it alone.
        service.run_cycle().await;
        assert_eq!(failing.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_passes_are_capped() {
        let service = service().await;
        let client = dummy_client().await;

        let gauge = Arc::new(Gauge::default());
        let collections: Vec<_> = (0..4)
            .map(|i| CountingCollection::slow(&format!("test:c{}", i), 100, gauge.clone()))
            .collect();
        for collection in &collections {
            service
                .register_pair(RegisteredPair {
                    account_id: "a1".into(),
                    client: client.clone(),
                    collection: collection.clone(),
                })
                .await;
        }

        service.run_cycle().await;

        for collection in &collections {
            assert_eq!(collection.fetches.load(Ordering::SeqCst), 1);
        }
        assert!(gauge.peak.load(Ordering::SeqCst) <= MAX_CONCURRENT_SYNCS);
    }

    #[tokio::test]
    async fn test_sync_now_ignores_backoff() {
        let service = service().await;
        let client = dummy_client().await;

        let failing = CountingCollection::failing("test:c1");
        service
            .register_pair(RegisteredPair {
                account_id: "a1".into(),
                client,
                collection: failing.clone(),
            })
            .await;

        service.run_cycle().await;
        assert_eq!(failing.fetches.load(Ordering::SeqCst), 1);

        // Manual sync runs even while the pair is backed off.
        let result = service.sync_now("a1", "test:c1").await;
        assert!(result.is_err());
        assert_eq!(failing.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_account_unregisters_pairs() {
        let service = service().await;
        let client = dummy_client().await;

        service
            .register_pair(RegisteredPair {
                account_id: "a1".into(),
                client: client.clone(),
                collection: CountingCollection::new("test:c1"),
            })
            .await;
        service
            .register_pair(RegisteredPair {
                account_id: "a2".into(),
                client,
                collection: CountingCollection::new("test:c1"),
            })
            .await;

        service.remove_account("a1").await;
        assert_eq!(service.pair_count().await, 1);
    }

    #[tokio::test]
    async fn test_restart_does_not_duplicate_interval_loops() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let crypto = Arc::new(crypto::test_service());
        let engine = Arc::new(SyncEngine::new(
            CacheStore::new(db.clone(), crypto),
            SyncStateStore::new(db),
            EventBus::new(),
        ));
        let bus = EventBus::new();
        let service = BackgroundSyncService::new(engine, bus.clone(), 1);

        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = cycles.clone();
        let _sub = bus.subscribe("sync:cycle_completed", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Pause only after setup: creating the sqlite pool under a paused
        // clock lets auto-advance trip the pool's acquire timeout while the
        // blocking database thread is still doing real work.
        tokio::time::pause();

        service.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.stop().await;
        service.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // From here only the restarted loop may tick: one cycle per
        // interval, with the superseded loop retiring on its first wake.
        let baseline = cycles.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3 * 60 + 1)).await;
        assert_eq!(cycles.load(Ordering::SeqCst), baseline + 3);

        service.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_flag() {
        let service = service().await;
        assert!(!service.is_running().await);

        service.start().await;
        assert!(service.is_running().await);
        // Second start is a no-op.
        service.start().await;

        service.stop().await;
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_load_sync_interval() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(load_sync_interval(&db).await, DEFAULT_SYNC_INTERVAL_MINUTES);

        sqlx::query("INSERT INTO preferences (key, value) VALUES (?, ?)")
            .bind(SYNC_INTERVAL_PREF_KEY)
            .bind("5")
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(load_sync_interval(&db).await, 5);

        sqlx::query("UPDATE preferences SET value = 'soon' WHERE key = ?")
            .bind(SYNC_INTERVAL_PREF_KEY)
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(load_sync_interval(&db).await, DEFAULT_SYNC_INTERVAL_MINUTES);
    }
}
