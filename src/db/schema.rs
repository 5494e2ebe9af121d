//! Row types and string-backed enums shared across the core.

use serde::{Deserialize, Serialize};

/// Remote service a plugin connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Slack,
    Notion,
    Teams,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Slack => "slack",
            ProviderKind::Notion => "notion",
            ProviderKind::Teams => "teams",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "slack" => Some(ProviderKind::Slack),
            "notion" => Some(ProviderKind::Notion),
            "teams" => Some(ProviderKind::Teams),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one authenticated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(ConnectionStatus::Connecting),
            "connected" => Some(ConnectionStatus::Connected),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

/// Persisted state of one (account, collection) sync pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Complete,
    Error,
    Degraded,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Complete => "complete",
            SyncStatus::Error => "error",
            SyncStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountRow {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub status: String,
    pub is_active: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncStateRow {
    pub id: String,
    pub account_id: String,
    pub collection: String,
    pub cursor: Option<String>,
    pub last_sync_at: Option<i64>,
    pub status: String,
    pub consecutive_failures: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CacheEntryRow {
    pub account_id: String,
    pub collection: String,
    pub remote_id: String,
    pub kind: String,
    pub title: Option<String>,
    pub body: String,
    pub url: Option<String>,
    pub author_id: Option<String>,
    pub parent_id: Option<String>,
    pub last_modified: i64,
    pub synced_at: i64,
    pub metadata: Option<String>,
}
