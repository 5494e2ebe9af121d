//! Local cache of remote snapshots with the replace-on-newer rule enforced
//! in the upsert itself.

use std::sync::Arc;

use crate::crypto::CryptoService;
use crate::db::schema::CacheEntryRow;
use crate::db::Database;

use super::SyncError;

/// Decrypted snapshot of one remote object.
#[derive(Debug, Clone)]
pub struct CacheEntry {
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
    pub metadata: Option<String>,
}

#[derive(Clone)]
pub struct CacheStore {
    db: Arc<Database>,
    crypto: Arc<CryptoService>,
}

impl CacheStore {
    pub fn new(db: Arc<Database>, crypto: Arc<CryptoService>) -> Self {
        Self { db, crypto }
    }

    /// Insert or replace a snapshot. An existing row is only replaced when
    /// the incoming `last_modified` is strictly newer, so replays and
    /// duplicate deliveries are no-ops. Returns whether the row changed.
    pub async fn upsert(&self, entry: &CacheEntry) -> Result<bool, SyncError> {
        let now = chrono::Utc::now().timestamp_millis();
        let encrypted_body = self
            .crypto
            .encrypt_string(&entry.body)
            .map_err(|e| SyncError::Crypto(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO cache_entries (account_id, collection, remote_id, kind, title, body, url, author_id, parent_id, last_modified, synced_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, collection, remote_id) DO UPDATE SET
                kind = excluded.kind,
                title = excluded.title,
                body = excluded.body,
                url = excluded.url,
                author_id = excluded.author_id,
                parent_id = excluded.parent_id,
                last_modified = excluded.last_modified,
                synced_at = excluded.synced_at,
                metadata = excluded.metadata
             WHERE excluded.last_modified > cache_entries.last_modified",
        )
        .bind(&entry.account_id)
        .bind(&entry.collection)
        .bind(&entry.remote_id)
        .bind(&entry.kind)
        .bind(&entry.title)
        .bind(&encrypted_body)
        .bind(&entry.url)
        .bind(&entry.author_id)
        .bind(&entry.parent_id)
        .bind(entry.last_modified)
        .bind(now)
        .bind(&entry.metadata)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(
        &self,
        account_id: &str,
        collection: &str,
        remote_id: &str,
    ) -> Result<Option<CacheEntry>, SyncError> {
        let row: Option<CacheEntryRow> = sqlx::query_as(
            "SELECT * FROM cache_entries
             WHERE account_id = ? AND collection = ? AND remote_id = ?",
        )
        .bind(account_id)
        .bind(collection)
        .bind(remote_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|row| self.decrypt_row(row)).transpose()
    }

    pub async fn list(
        &self,
        account_id: &str,
        collection: &str,
    ) -> Result<Vec<CacheEntry>, SyncError> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(
            "SELECT * FROM cache_entries
             WHERE account_id = ? AND collection = ?
             ORDER BY last_modified DESC",
        )
        .bind(account_id)
        .bind(collection)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(|row| self.decrypt_row(row)).collect()
    }

    pub async fn count(&self, account_id: &str, collection: &str) -> Result<i64, SyncError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cache_entries WHERE account_id = ? AND collection = ?",
        )
        .bind(account_id)
        .bind(collection)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.0)
    }

    /// Explicit eviction, used by full resync and disconnect.
    pub async fn clear_collection(
        &self,
        account_id: &str,
        collection: &str,
    ) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE account_id = ? AND collection = ?",
        )
        .bind(account_id)
        .bind(collection)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn clear_account(&self, account_id: &str) -> Result<u64, SyncError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE account_id = ?")
            .bind(account_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected())
    }

    fn decrypt_row(&self, row: CacheEntryRow) -> Result<CacheEntry, SyncError> {
        let body = self
            .crypto
            .decrypt_string(&row.body)
            .map_err(|e| SyncError::Crypto(e.to_string()))?;

        Ok(CacheEntry {
            account_id: row.account_id,
            collection: row.collection,
            remote_id: row.remote_id,
            kind: row.kind,
            title: row.title,
            body,
            url: row.url,
            author_id: row.author_id,
            parent_id: row.parent_id,
            last_modified: row.last_modified,
            metadata: row.metadata,
        })
    }
}
