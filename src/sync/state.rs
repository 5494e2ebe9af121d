//! Persisted sync progress per (account, collection) pair.

use std::sync::Arc;

use crate::db::schema::{SyncStateRow, SyncStatus};
use crate::db::Database;

use super::SyncError;

#[derive(Clone)]
pub struct SyncStateStore {
    db: Arc<Database>,
}

impl SyncStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn get(
        &self,
        account_id: &str,
        collection: &str,
    ) -> Result<Option<SyncStateRow>, SyncError> {
        let row = sqlx::query_as(
            "SELECT * FROM sync_state WHERE account_id = ? AND collection = ?",
        )
        .bind(account_id)
        .bind(collection)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    pub async fn cursor(
        &self,
        account_id: &str,
        collection: &str,
    ) -> Result<Option<String>, SyncError> {
        Ok(self.get(account_id, collection).await?.and_then(|r| r.cursor))
    }

    /// Transition the pair's status without touching the cursor.
    pub async fn set_status(
        &self,
        account_id: &str,
        collection: &str,
        status: SyncStatus,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO sync_state (id, account_id, collection, status)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id, collection) DO UPDATE SET
                status = excluded.status",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(collection)
        .bind(status.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Record a clean pass: advance the cursor, stamp the time, and zero the
    /// failure streak. The cursor only moves here, never on failure.
    pub async fn record_success(
        &self,
        account_id: &str,
        collection: &str,
        cursor: Option<&str>,
    ) -> Result<(), SyncError> {
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO sync_state (id, account_id, collection, cursor, last_sync_at, status, consecutive_failures, error_message)
             VALUES (?, ?, ?, ?, ?, ?, 0, NULL)
             ON CONFLICT(account_id, collection) DO UPDATE SET
                cursor = excluded.cursor,
                last_sync_at = excluded.last_sync_at,
                status = excluded.status,
                consecutive_failures = 0,
                error_message = NULL",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(collection)
        .bind(cursor)
        .bind(now)
        .bind(SyncStatus::Complete.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Record a failed pass. The cursor stays where the last clean pass left
    /// it. Returns the updated failure streak.
    pub async fn record_failure(
        &self,
        account_id: &str,
        collection: &str,
        status: SyncStatus,
        error_message: &str,
    ) -> Result<i64, SyncError> {
        sqlx::query(
            "INSERT INTO sync_state (id, account_id, collection, status, consecutive_failures, error_message)
             VALUES (?, ?, ?, ?, 1, ?)
             ON CONFLICT(account_id, collection) DO UPDATE SET
                status = excluded.status,
                consecutive_failures = sync_state.consecutive_failures + 1,
                error_message = excluded.error_message",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(collection)
        .bind(status.as_str())
        .bind(error_message)
        .execute(self.db.pool())
        .await?;

        let row = self.get(account_id, collection).await?;
        Ok(row.map(|r| r.consecutive_failures).unwrap_or(0))
    }

    /// Drop the cursor so the next pass is a full one.
    pub async fn clear_cursor(
        &self,
        account_id: &str,
        collection: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "UPDATE sync_state SET cursor = NULL WHERE account_id = ? AND collection = ?",
        )
        .bind(account_id)
        .bind(collection)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    pub async fn remove_account(&self, account_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM sync_state WHERE account_id = ?")
            .bind(account_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn list_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<SyncStateRow>, SyncError> {
        let rows = sqlx::query_as(
            "SELECT * FROM sync_state WHERE account_id = ? ORDER BY collection",
        )
        .bind(account_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }
}
