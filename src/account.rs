//! Account management: one row per authenticated connection to a remote
//! service, with at most one "active" account per provider.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::schema::{AccountRow, ConnectionStatus, ProviderKind};
use crate::db::Database;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub provider: ProviderKind,
    pub display_name: String,
    pub status: ConnectionStatus,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    fn from_row(row: AccountRow) -> Option<Self> {
        Some(Self {
            provider: ProviderKind::parse(&row.provider)?,
            status: ConnectionStatus::parse(&row.status)?,
            id: row.id,
            display_name: row.display_name,
            is_active: row.is_active != 0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct AccountStore {
    db: Arc<Database>,
}

impl AccountStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new account in `connecting` state. The first account for a
    /// provider becomes active automatically.
    pub async fn create(
        &self,
        provider: ProviderKind,
        display_name: &str,
    ) -> Result<Account, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();

        let existing: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM accounts WHERE provider = ?")
                .bind(provider.as_str())
                .fetch_one(self.db.pool())
                .await?;
        let is_active = existing.0 == 0;

        sqlx::query(
            "INSERT INTO accounts (id, provider, display_name, status, is_active, created_at, updated_at)
             VALUES (?, ?, ?, 'connecting', ?, ?, ?)",
        )
        .bind(&id)
        .bind(provider.as_str())
        .bind(display_name)
        .bind(is_active as i64)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        Ok(Account {
            id,
            provider,
            display_name: display_name.to_string(),
            status: ConnectionStatus::Connecting,
            is_active,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get(&self, account_id: &str) -> Result<Option<Account>, sqlx::Error> {
        let row: Option<AccountRow> = sqlx::query_as("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.and_then(Account::from_row))
    }

    pub async fn list(&self, provider: Option<ProviderKind>) -> Result<Vec<Account>, sqlx::Error> {
        let rows: Vec<AccountRow> = match provider {
            Some(kind) => {
                sqlx::query_as(
                    "SELECT * FROM accounts WHERE provider = ? ORDER BY created_at",
                )
                .bind(kind.as_str())
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM accounts ORDER BY created_at")
                    .fetch_all(self.db.pool())
                    .await?
            }
        };

        Ok(rows.into_iter().filter_map(Account::from_row).collect())
    }

    pub async fn set_status(
        &self,
        account_id: &str,
        status: ConnectionStatus,
    ) -> Result<(), sqlx::Error> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query("UPDATE accounts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(account_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Make one account the active one for its provider, clearing the flag
    /// on every sibling.
    pub async fn set_active(&self, account_id: &str) -> Result<(), sqlx::Error> {
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "UPDATE accounts SET is_active = 0, updated_at = ?
             WHERE provider = (SELECT provider FROM accounts WHERE id = ?)",
        )
        .bind(now)
        .bind(account_id)
        .execute(self.db.pool())
        .await?;

        sqlx::query("UPDATE accounts SET is_active = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(account_id)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    pub async fn active_account(
        &self,
        provider: ProviderKind,
    ) -> Result<Option<Account>, sqlx::Error> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT * FROM accounts WHERE provider = ? AND is_active = 1 LIMIT 1",
        )
        .bind(provider.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.and_then(Account::from_row))
    }

    pub async fn remove(&self, account_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
