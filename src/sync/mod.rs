//! Incremental synchronization of remote collections into the local cache.
//!
//! The engine is provider-agnostic: it drives any [`RemoteCollection`]
//! through paged passes, persists an opaque cursor per (account,
//! collection) pair, and applies fetched items through the
//! replace-on-newer cache rule.

pub mod background;
pub mod cache;
pub mod collection;
pub mod engine;
pub mod queue;
pub mod state;

use thiserror::Error;

use crate::client::ClientError;

pub use background::{
    load_sync_interval, BackgroundSyncService, RegisteredPair, DEFAULT_SYNC_INTERVAL_MINUTES,
};
pub use cache::{CacheEntry, CacheStore};
pub use collection::{CollectionPage, PageRequest, RemoteCollection, RemoteItem};
pub use engine::{SyncEngine, SyncReport};
pub use queue::{SyncQueue, SyncRequest};
pub use state::SyncStateStore;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync of {collection} for account {account_id} failed: {source}")]
    Client {
        account_id: String,
        collection: String,
        #[source]
        source: ClientError,
    },

    #[error("Sync already in progress for {collection} on account {account_id}")]
    AlreadyInProgress {
        account_id: String,
        collection: String,
    },

    #[error("Sync of {collection} for account {account_id} was cancelled")]
    Cancelled {
        account_id: String,
        collection: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl SyncError {
    /// Whether retrying the same pass later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Client { source, .. } => source.is_retryable(),
            SyncError::AlreadyInProgress { .. } => false,
            SyncError::Cancelled { .. } => false,
            SyncError::Database(_) => false,
            SyncError::Crypto(_) => false,
        }
    }
}
