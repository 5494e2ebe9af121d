//! Flow Desk integration core: one rate-limited sync client shared by the
//! Slack, Notion, and Microsoft Teams plugins.
//!
//! The host shell embeds a [`runtime::PluginRuntime`], registers providers
//! and collections, and receives lifecycle events, search documents, and
//! automation triggers in return. Everything else — encrypted token
//! storage, per-endpoint rate limiting, incremental sync with cursor
//! safety — lives behind that facade.

pub mod account;
pub mod auth;
pub mod bridge;
pub mod client;
pub mod crypto;
pub mod db;
pub mod events;
pub mod index;
pub mod providers;
pub mod runtime;
pub mod sync;

pub use account::{Account, AccountStore};
pub use auth::{OAuthClient, OAuthConfig, TokenSet, TokenStore};
pub use bridge::{ActionHandler, AutomationSink, EventBridge, RemoteEvent};
pub use client::{ApiClient, ClientError, RateLimiter};
pub use db::schema::{ConnectionStatus, ProviderKind, SyncStatus};
pub use db::Database;
pub use events::{EventBus, Subscription, SubscriptionRegistry};
pub use index::{Indexer, MemoryIndex, SearchHit, SearchIndex, SearchableDocument};
pub use runtime::{PluginRuntime, RuntimeError};
pub use sync::{
    BackgroundSyncService, CacheEntry, CacheStore, RemoteCollection, RemoteItem, SyncEngine,
    SyncError, SyncQueue,
};
