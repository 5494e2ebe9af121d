//! Token lifecycle: encrypted persistence, expiry checks, and single-flight
//! refresh.

pub mod oauth;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::crypto::CryptoService;
use crate::db::Database;

pub use oauth::{OAuthClient, OAuthConfig, OAuthError};

/// Expiry skew applied before a token is considered stale, so requests never
/// go out with a token about to lapse mid-flight.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No credentials stored for account {0}")]
    NotConnected(String),

    #[error("No refresh token for account {0}, re-authentication required")]
    NoRefreshToken(String),

    #[error("Token refresh rejected: {0}")]
    Rejected(String),

    #[error("OAuth error: {0}")]
    OAuth(#[from] OAuthError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// One account's OAuth tokens. The access token is opaque and owned
/// exclusively by the token store; other components receive it only for the
/// duration of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Milliseconds since epoch. Tokens without an expiry never go stale.
    pub expires_at: Option<i64>,
    pub scope: Option<String>,
    pub obtained_at: i64,
}

impl TokenSet {
    pub fn is_expired(&self, skew_seconds: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                chrono::Utc::now().timestamp_millis() + skew_seconds * 1000 >= expires_at
            }
            None => false,
        }
    }
}

pub struct TokenStore {
    db: Arc<Database>,
    crypto: Arc<CryptoService>,
    /// One lock per account so concurrent stale observations coalesce into a
    /// single refresh call.
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenStore {
    pub fn new(db: Arc<Database>, crypto: Arc<CryptoService>) -> Self {
        Self {
            db,
            crypto,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a token set, replacing any previous one for the account.
    pub async fn save(&self, account_id: &str, tokens: &TokenSet) -> Result<(), AuthError> {
        let json = serde_json::to_string(tokens)
            .map_err(|e| AuthError::Crypto(e.to_string()))?;
        let encrypted = self
            .crypto
            .encrypt_string(&json)
            .map_err(|e| AuthError::Crypto(e.to_string()))?;
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO credentials (account_id, encrypted_data, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET
                encrypted_data = excluded.encrypted_data,
                updated_at = excluded.updated_at",
        )
        .bind(account_id)
        .bind(&encrypted)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    pub async fn get(&self, account_id: &str) -> Result<Option<TokenSet>, AuthError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT encrypted_data FROM credentials WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(self.db.pool())
                .await?;

        let Some((encrypted,)) = row else {
            return Ok(None);
        };

        let json = self
            .crypto
            .decrypt_string(&encrypted)
            .map_err(|e| AuthError::Crypto(e.to_string()))?;
        let tokens =
            serde_json::from_str(&json).map_err(|e| AuthError::Crypto(e.to_string()))?;

        Ok(Some(tokens))
    }

    pub async fn remove(&self, account_id: &str) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM credentials WHERE account_id = ?")
            .bind(account_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Return a token valid for at least the skew window, refreshing first
    /// if the stored one is stale.
    pub async fn fresh_token(
        &self,
        account_id: &str,
        oauth: &OAuthClient,
    ) -> Result<TokenSet, AuthError> {
        let current = self
            .get(account_id)
            .await?
            .ok_or_else(|| AuthError::NotConnected(account_id.to_string()))?;

        if !current.is_expired(TOKEN_EXPIRY_SKEW_SECS) {
            return Ok(current);
        }

        self.refresh_if_stale(account_id, &current.access_token, oauth)
            .await
    }

    /// Refresh the account's tokens, but only if the stored access token is
    /// still the one the caller found stale. Callers that lost the race get
    /// the replacement token without a second provider round trip.
    pub async fn refresh_if_stale(
        &self,
        account_id: &str,
        stale_access_token: &str,
        oauth: &OAuthClient,
    ) -> Result<TokenSet, AuthError> {
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let current = self
            .get(account_id)
            .await?
            .ok_or_else(|| AuthError::NotConnected(account_id.to_string()))?;

        if current.access_token != stale_access_token {
            tracing::debug!("Token for {} already refreshed by another caller", account_id);
            return Ok(current);
        }

        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::NoRefreshToken(account_id.to_string()))?;

        tracing::info!("Refreshing access token for account {}", account_id);

        let mut renewed = match oauth.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(OAuthError::Provider(msg)) => return Err(AuthError::Rejected(msg)),
            Err(e) => return Err(AuthError::OAuth(e)),
        };

        // Providers that rotate refresh tokens send a new one; the rest
        // expect the old one to be reused.
        if renewed.refresh_token.is_none() {
            renewed.refresh_token = Some(refresh_token);
        }

        self.save(account_id, &renewed).await?;

        Ok(renewed)
    }
}
