//! The plugin-runtime facade the host shell talks to.
//!
//! One [`PluginRuntime`] owns the shared infrastructure (database, crypto,
//! token store, sync engine, scheduler, bridge) and wires provider plugins
//! into it: register a provider, connect accounts, register collections,
//! and the background loop keeps the local cache and search index current.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;

use crate::account::{Account, AccountStore};
use crate::auth::{AuthError, OAuthClient, OAuthConfig, OAuthError, TokenStore};
use crate::bridge::{ActionHandler, AutomationSink, BridgeError, EventBridge, RemoteEvent};
use crate::client::{ApiClient, ClientError};
use crate::crypto::CryptoService;
use crate::db::schema::{ConnectionStatus, ProviderKind};
use crate::db::{Database, DbError};
use crate::events::EventBus;
use crate::index::{IndexError, Indexer, SearchHit, SearchIndex};
use crate::providers;
use crate::sync::{
    load_sync_interval, BackgroundSyncService, CacheStore, RegisteredPair, RemoteCollection,
    SyncEngine, SyncError, SyncQueue, SyncStateStore,
};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No provider registered for {0}")]
    ProviderNotRegistered(ProviderKind),

    #[error("No account with id {0}")]
    AccountNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

struct ProviderHandle {
    oauth: Arc<OAuthClient>,
    client: Arc<ApiClient>,
}

pub struct PluginRuntime {
    accounts: AccountStore,
    tokens: Arc<TokenStore>,
    engine: Arc<SyncEngine>,
    background: BackgroundSyncService,
    queue: Arc<SyncQueue>,
    indexer: Arc<Indexer>,
    bridge: Arc<EventBridge>,
    bus: EventBus,
    providers: StdMutex<HashMap<ProviderKind, Arc<ProviderHandle>>>,
}

impl PluginRuntime {
    /// Open the runtime against the host-assigned data directory, with the
    /// host's search index and automation sink.
    pub async fn open(
        data_dir: &Path,
        index: Arc<dyn SearchIndex>,
        sink: Arc<dyn AutomationSink>,
    ) -> Result<Self, RuntimeError> {
        let db = Arc::new(Database::open(data_dir).await?);
        let crypto =
            Arc::new(CryptoService::new().map_err(|e| RuntimeError::Crypto(e.to_string()))?);
        let interval = load_sync_interval(&db).await;

        Ok(Self::assemble(db, crypto, index, sink, interval))
    }

    fn assemble(
        db: Arc<Database>,
        crypto: Arc<CryptoService>,
        index: Arc<dyn SearchIndex>,
        sink: Arc<dyn AutomationSink>,
        interval_minutes: u64,
    ) -> Self {
        let bus = EventBus::new();
        let tokens = Arc::new(TokenStore::new(db.clone(), crypto.clone()));
        let indexer = Arc::new(Indexer::new(index));
        let bridge = Arc::new(EventBridge::new(sink));

        let engine = Arc::new(
            SyncEngine::new(
                CacheStore::new(db.clone(), crypto),
                SyncStateStore::new(db.clone()),
                bus.clone(),
            )
            .with_indexer(indexer.clone())
            .with_bridge(bridge.clone()),
        );
        let background = BackgroundSyncService::new(engine.clone(), bus.clone(), interval_minutes);

        Self {
            accounts: AccountStore::new(db),
            tokens,
            engine,
            background,
            queue: Arc::new(SyncQueue::new()),
            indexer,
            bridge,
            bus,
            providers: StdMutex::new(HashMap::new()),
        }
    }

    /// Register a provider plugin with its OAuth application credentials,
    /// using the provider's stock endpoints.
    pub fn register_provider(
        &self,
        kind: ProviderKind,
        client_id: &str,
        client_secret: &str,
    ) -> Result<(), RuntimeError> {
        self.register_provider_config(
            providers::oauth_config(kind, client_id, client_secret),
            providers::base_url(kind),
        )
    }

    /// Register a provider with explicit endpoints. Embedders use this for
    /// sovereign-cloud deployments or API gateways.
    pub fn register_provider_config(
        &self,
        config: OAuthConfig,
        base_url: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let kind = config.provider;
        let oauth = Arc::new(OAuthClient::new(config));

        let mut client = ApiClient::new(base_url, self.tokens.clone(), oauth.clone())?;
        if let Some((name, value)) = providers::api_version_header(kind) {
            client = client.with_header(name, value)?;
        }

        let mut handles = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        handles.insert(
            kind,
            Arc::new(ProviderHandle {
                oauth,
                client: Arc::new(client),
            }),
        );
        tracing::info!("Registered provider {}", kind);
        Ok(())
    }

    fn provider(&self, kind: ProviderKind) -> Result<Arc<ProviderHandle>, RuntimeError> {
        let handles = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .get(&kind)
            .cloned()
            .ok_or(RuntimeError::ProviderNotRegistered(kind))
    }

    /// Run the provider's OAuth dance and persist the resulting account.
    pub async fn connect_account(
        &self,
        kind: ProviderKind,
        display_name: &str,
    ) -> Result<Account, RuntimeError> {
        let handle = self.provider(kind)?;

        let account = self.accounts.create(kind, display_name).await?;
        let tokens = match handle.oauth.start_flow().await {
            Ok(tokens) => tokens,
            Err(e) => {
                // No credentials, no account row.
                self.accounts.remove(&account.id).await?;
                return Err(e.into());
            }
        };

        self.tokens.save(&account.id, &tokens).await?;
        self.accounts
            .set_status(&account.id, ConnectionStatus::Connected)
            .await?;

        tracing::info!("Connected {} account {}", kind, account.id);
        self.bus.emit(
            "account:connected",
            serde_json::json!({ "account_id": account.id, "provider": kind.as_str() }),
        );

        self.accounts
            .get(&account.id)
            .await?
            .ok_or_else(|| RuntimeError::AccountNotFound(account.id))
    }

    /// Tear an account down: cancel its syncs and wipe credentials, cursors,
    /// cached rows, and index documents.
    pub async fn disconnect_account(&self, account_id: &str) -> Result<(), RuntimeError> {
        let account = self
            .accounts
            .get(account_id)
            .await?
            .ok_or_else(|| RuntimeError::AccountNotFound(account_id.to_string()))?;

        self.engine.cancel_account(account_id);
        self.background.remove_account(account_id).await;
        self.queue.remove_account(account_id).await;

        self.tokens.remove(account_id).await?;
        self.engine.states().remove_account(account_id).await?;
        self.engine.cache().clear_account(account_id).await?;
        self.indexer.remove_account(account_id).await;
        self.accounts.remove(account_id).await?;

        tracing::info!("Disconnected {} account {}", account.provider, account_id);
        self.bus.emit(
            "account:disconnected",
            serde_json::json!({ "account_id": account_id, "provider": account.provider.as_str() }),
        );
        Ok(())
    }

    /// Put a collection under background sync for the account.
    pub async fn register_collection(
        &self,
        account_id: &str,
        collection: Arc<dyn RemoteCollection>,
    ) -> Result<(), RuntimeError> {
        let account = self
            .accounts
            .get(account_id)
            .await?
            .ok_or_else(|| RuntimeError::AccountNotFound(account_id.to_string()))?;
        let handle = self.provider(account.provider)?;

        self.background
            .register_pair(RegisteredPair {
                account_id: account_id.to_string(),
                client: handle.client.clone(),
                collection,
            })
            .await;
        Ok(())
    }

    pub async fn start_background_sync(&self) {
        self.background.start().await;
    }

    pub async fn stop_background_sync(&self) {
        self.background.stop().await;
    }

    /// Incremental sync of one registered collection, right now.
    pub async fn sync_now(
        &self,
        account_id: &str,
        collection_key: &str,
    ) -> Result<usize, RuntimeError> {
        Ok(self.background.sync_now(account_id, collection_key).await?)
    }

    /// Drop local data for one registered collection and re-fetch it.
    pub async fn full_resync(
        &self,
        account_id: &str,
        collection_key: &str,
    ) -> Result<usize, RuntimeError> {
        let Some(pair) = self.background.get_pair(account_id, collection_key).await else {
            return Err(RuntimeError::AccountNotFound(account_id.to_string()));
        };

        let report = self
            .engine
            .full_sync(&pair.client, account_id, &*pair.collection)
            .await?;
        Ok(report.applied)
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RuntimeError> {
        Ok(self.indexer.search(query, limit).await?)
    }

    pub fn register_trigger<F>(&self, id: &str, predicate: F)
    where
        F: Fn(&RemoteEvent) -> bool + Send + Sync + 'static,
    {
        self.bridge.register_trigger(id, predicate);
    }

    pub fn unregister_trigger(&self, id: &str) -> bool {
        self.bridge.unregister_trigger(id)
    }

    pub fn register_action(&self, id: &str, handler: Arc<dyn ActionHandler>) {
        self.bridge.register_action(id, handler);
    }

    pub async fn run_action(
        &self,
        id: &str,
        config: serde_json::Value,
    ) -> Result<serde_json::Value, RuntimeError> {
        Ok(self.bridge.run_action(id, config).await?)
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn sync_queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }
}
