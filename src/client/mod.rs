//! Authenticated, rate-limit-aware HTTP dispatch shared by every provider.
//!
//! All transport and provider failures are translated into [`ClientError`]
//! before they reach the sync engine; raw transport errors never escape this
//! module.

pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::auth::{AuthError, OAuthClient, OAuthError, TokenStore};

pub use rate_limit::RateLimiter;

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// 429 responses are retried through the rate limiter's deadline wait at
/// most this many times before surfacing.
const MAX_RATE_LIMIT_ATTEMPTS: u32 = 3;

/// Network failures on idempotent requests: exponential backoff, bounded.
const NETWORK_MAX_RETRIES: u32 = 3;
const NETWORK_BASE_DELAY_MS: u64 = 500;
const NETWORK_MAX_DELAY_MS: u64 = 8_000;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Non-retryable. The account needs re-authentication.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The endpoint stayed throttled through every bounded retry.
    #[error("Rate limited on {endpoint} after {attempts} attempts")]
    RateLimited { endpoint: String, attempts: u32 },

    /// Transport-level failure with no usable response.
    #[error("Network error: {0}")]
    Network(String),

    /// Provider returned a non-2xx response; code/message preserved.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether the sync engine may retry the operation on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Auth(_) | ClientError::Internal(_) => false,
            ClientError::RateLimited { .. } | ClientError::Network(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
        }
    }
}

impl From<AuthError> for ClientError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NotConnected(_)
            | AuthError::NoRefreshToken(_)
            | AuthError::Rejected(_) => ClientError::Auth(err.to_string()),
            AuthError::OAuth(inner) => match inner {
                OAuthError::Http(_) | OAuthError::Io(_) | OAuthError::Timeout => {
                    ClientError::Network(inner.to_string())
                }
                _ => ClientError::Auth(inner.to_string()),
            },
            AuthError::Database(e) => ClientError::Internal(e.to_string()),
            AuthError::Crypto(e) => ClientError::Internal(e),
        }
    }
}

#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body).map_err(|e| ClientError::Api {
            status: self.status,
            code: None,
            message: format!("Invalid response body: {}", e),
        })
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    oauth: Arc<OAuthClient>,
    limiter: RateLimiter,
    extra_headers: HeaderMap,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<TokenStore>,
        oauth: Arc<OAuthClient>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ClientError::Internal(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            tokens,
            oauth,
            limiter: RateLimiter::new(),
            extra_headers: HeaderMap::new(),
        })
    }

    /// Add a header sent on every request, e.g. a provider API version.
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self, ClientError> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::Internal(format!("Invalid header value: {}", e)))?;
        self.extra_headers.insert(name, value);
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Issue an authenticated request.
    ///
    /// Token resolution (with transparent refresh), rate-limit gating, one
    /// 401-refresh-retry, bounded 429 retries, and bounded network backoff
    /// for idempotent GETs all happen here. Non-idempotent methods are never
    /// blind-retried on network failure; the caller decides.
    pub async fn request(
        &self,
        account_id: &str,
        method: Method,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, ClientError> {
        let endpoint_key = endpoint_key(path_and_query);
        let url = format!("{}{}", self.base_url, path_and_query);

        let mut token = self.tokens.fresh_token(account_id, &self.oauth).await?;
        let mut refreshed = false;
        let mut rate_attempts: u32 = 0;
        let mut network_retries: u32 = 0;

        loop {
            self.limiter.before_request(&endpoint_key).await;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .headers(self.extra_headers.clone())
                .bearer_auth(&token.access_token);
            if let Some(json) = body {
                request = request.json(json);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let retryable = method == Method::GET && network_retries < NETWORK_MAX_RETRIES;
                    if !retryable {
                        return Err(ClientError::Network(e.to_string()));
                    }
                    let delay = (NETWORK_BASE_DELAY_MS << network_retries)
                        .min(NETWORK_MAX_DELAY_MS);
                    network_retries += 1;
                    tracing::warn!(
                        "Network error on {} (retry {}/{} in {}ms): {}",
                        endpoint_key,
                        network_retries,
                        NETWORK_MAX_RETRIES,
                        delay,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    continue;
                }
            };

            let status = response.status().as_u16();
            self.limiter
                .after_response(&endpoint_key, status, response.headers());

            if status == 401 {
                if refreshed {
                    return Err(ClientError::Auth(
                        "Request still unauthorized after token refresh".into(),
                    ));
                }
                refreshed = true;
                token = self
                    .tokens
                    .refresh_if_stale(account_id, &token.access_token, &self.oauth)
                    .await?;
                continue;
            }

            if status == 429 {
                rate_attempts += 1;
                if rate_attempts >= MAX_RATE_LIMIT_ATTEMPTS {
                    return Err(ClientError::RateLimited {
                        endpoint: endpoint_key,
                        attempts: rate_attempts,
                    });
                }
                // The limiter recorded the Retry-After deadline; the next
                // before_request call waits it out.
                continue;
            }

            let body_bytes = response
                .bytes()
                .await
                .map_err(|e| ClientError::Network(e.to_string()))?
                .to_vec();

            if !(200..300).contains(&status) {
                let (code, message) = parse_error_body(&body_bytes, status);
                return Err(ClientError::Api {
                    status,
                    code,
                    message,
                });
            }

            return Ok(ApiResponse {
                status,
                body: body_bytes,
            });
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        account_id: &str,
        path_and_query: &str,
    ) -> Result<T, ClientError> {
        self.request(account_id, Method::GET, path_and_query, None)
            .await?
            .json()
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        account_id: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ClientError> {
        self.request(account_id, Method::POST, path, Some(body))
            .await?
            .json()
    }
}

/// Rate-limit bookkeeping key: the path without its query string.
fn endpoint_key(path_and_query: &str) -> String {
    path_and_query
        .split('?')
        .next()
        .unwrap_or(path_and_query)
        .to_string()
}

/// Pull a provider error code/message out of a failure body, tolerating the
/// common shapes (`{"error": "..."}`,`{"error": {"code", "message"}}`,
/// `{"message": "..."}`).
fn parse_error_body(body: &[u8], status: u16) -> (Option<String>, String) {
    let fallback = move || format!("HTTP {}", status);

    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        let text = String::from_utf8_lossy(body);
        let trimmed = text.trim();
        return (
            None,
            if trimmed.is_empty() {
                fallback()
            } else {
                trimmed.to_string()
            },
        );
    };

    let code = value["error"]
        .as_str()
        .or_else(|| value["error"]["code"].as_str())
        .or_else(|| value["code"].as_str())
        .map(String::from);

    let message = value["message"]
        .as_str()
        .or_else(|| value["error"]["message"].as_str())
        .or_else(|| value["error"].as_str())
        .map(String::from)
        .unwrap_or_else(fallback);

    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{OAuthConfig, TokenSet};
    use crate::crypto;
    use crate::db::schema::ProviderKind;
    use crate::db::Database;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn http_response(status_line: &str, extra_headers: &[(&str, &str)], body: &str) -> String {
        let mut response = format!("HTTP/1.1 {}\r\n", status_line);
        for (name, value) in extra_headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ));
        response
    }

    /// Serves one scripted response per connection, in order.
    async fn spawn_script_server(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let script = Arc::new(StdMutex::new(VecDeque::from(responses)));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let Some(response) = script.lock().unwrap().pop_front() else {
                    break;
                };

                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    async fn client_with_token(
        base_url: String,
        token_url: String,
        token: TokenSet,
    ) -> (ApiClient, Arc<TokenStore>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let crypto = Arc::new(crypto::test_service());
        let tokens = Arc::new(TokenStore::new(db, crypto));
        tokens.save("acct-1", &token).await.unwrap();

        let oauth = Arc::new(OAuthClient::new(OAuthConfig {
            provider: ProviderKind::Slack,
            client_id: "id".into(),
            client_secret: "secret".into(),
            authorize_url: "https://example.invalid/authorize".into(),
            token_url,
            redirect_port: 0,
            authorize_params: vec![],
            use_pkce: false,
        }));

        let client = ApiClient::new(base_url, tokens.clone(), oauth).unwrap();
        (client, tokens)
    }

    fn valid_token(access: &str) -> TokenSet {
        let now = chrono::Utc::now().timestamp_millis();
        TokenSet {
            access_token: access.into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Some(now + 3_600_000),
            scope: None,
            obtained_at: now,
        }
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let (base_url, hits) = spawn_script_server(vec![http_response(
            "200 OK",
            &[],
            r#"{"ok":true,"value":42}"#,
        )])
        .await;
        let (client, _) =
            client_with_token(base_url, "http://127.0.0.1:1".into(), valid_token("tok")).await;

        let response = client
            .request("acct-1", Method::GET, "/api/things", None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["value"], 42);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_429_then_200_waits_out_retry_after() {
        let (base_url, hits) = spawn_script_server(vec![
            http_response("429 Too Many Requests", &[("Retry-After", "2")], "{}"),
            http_response("200 OK", &[], r#"{"ok":true}"#),
        ])
        .await;
        let (client, _) =
            client_with_token(base_url, "http://127.0.0.1:1".into(), valid_token("tok")).await;

        let start = std::time::Instant::now();
        let response = client
            .request("acct-1", Method::GET, "/api/slow", None)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert!(
            start.elapsed() >= Duration::from_secs(2),
            "elapsed {:?}",
            start.elapsed()
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_429_retries_are_bounded() {
        let throttled = http_response("429 Too Many Requests", &[("Retry-After", "0")], "{}");
        let (base_url, hits) =
            spawn_script_server(vec![throttled.clone(), throttled.clone(), throttled]).await;
        let (client, _) =
            client_with_token(base_url, "http://127.0.0.1:1".into(), valid_token("tok")).await;

        let result = client
            .request("acct-1", Method::GET, "/api/hot", None)
            .await;

        match result {
            Err(ClientError::RateLimited { endpoint, attempts }) => {
                assert_eq!(endpoint, "/api/hot");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RateLimited, got {:?}", other.map(|r| r.status)),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_401_refreshes_once_then_retries() {
        let (token_url, refresh_hits) = spawn_script_server(vec![http_response(
            "200 OK",
            &[],
            r#"{"access_token":"renewed","expires_in":3600}"#,
        )])
        .await;
        let (base_url, api_hits) = spawn_script_server(vec![
            http_response("401 Unauthorized", &[], r#"{"error":"invalid_auth"}"#),
            http_response("200 OK", &[], r#"{"ok":true}"#),
        ])
        .await;
        let (client, tokens) =
            client_with_token(base_url, format!("{}/token", token_url), valid_token("stale"))
                .await;

        let response = client
            .request("acct-1", Method::GET, "/api/me", None)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(refresh_hits.load(Ordering::SeqCst), 1);
        assert_eq!(api_hits.load(Ordering::SeqCst), 2);

        let stored = tokens.get("acct-1").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "renewed");
    }

    #[tokio::test]
    async fn test_second_401_is_terminal_auth_error() {
        let (token_url, refresh_hits) = spawn_script_server(vec![http_response(
            "200 OK",
            &[],
            r#"{"access_token":"renewed","expires_in":3600}"#,
        )])
        .await;
        let unauthorized = http_response("401 Unauthorized", &[], r#"{"error":"invalid_auth"}"#);
        let (base_url, _) = spawn_script_server(vec![unauthorized.clone(), unauthorized]).await;
        let (client, _) =
            client_with_token(base_url, format!("{}/token", token_url), valid_token("stale"))
                .await;

        let result = client.request("acct-1", Method::GET, "/api/me", None).await;

        assert!(matches!(result, Err(ClientError::Auth(_))));
        // Exactly one refresh attempt; the second 401 surfaces immediately.
        assert_eq!(refresh_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_2xx_preserves_provider_error() {
        let (base_url, _) = spawn_script_server(vec![http_response(
            "404 Not Found",
            &[],
            r#"{"error":"channel_not_found","message":"No such channel"}"#,
        )])
        .await;
        let (client, _) =
            client_with_token(base_url, "http://127.0.0.1:1".into(), valid_token("tok")).await;

        let result = client
            .request("acct-1", Method::GET, "/api/channel", None)
            .await;

        match result {
            Err(ClientError::Api {
                status,
                code,
                message,
            }) => {
                assert_eq!(status, 404);
                assert_eq!(code.as_deref(), Some("channel_not_found"));
                assert_eq!(message, "No such channel");
            }
            other => panic!("expected Api error, got {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn test_network_failure_on_post_is_not_retried() {
        // Nothing is listening on this port.
        let (client, _) = client_with_token(
            "http://127.0.0.1:1".into(),
            "http://127.0.0.1:1".into(),
            valid_token("tok"),
        )
        .await;

        let start = std::time::Instant::now();
        let result = client
            .request(
                "acct-1",
                Method::POST,
                "/api/write",
                Some(&serde_json::json!({"a": 1})),
            )
            .await;

        assert!(matches!(result, Err(ClientError::Network(_))));
        // One attempt, no backoff loop for non-idempotent methods.
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_retryability() {
        assert!(!ClientError::Auth("x".into()).is_retryable());
        assert!(ClientError::Network("x".into()).is_retryable());
        assert!(ClientError::RateLimited {
            endpoint: "e".into(),
            attempts: 3
        }
        .is_retryable());
        assert!(ClientError::Api {
            status: 502,
            code: None,
            message: "bad gateway".into()
        }
        .is_retryable());
        assert!(!ClientError::Api {
            status: 404,
            code: None,
            message: "missing".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_endpoint_key_strips_query() {
        assert_eq!(endpoint_key("/api/list?cursor=abc"), "/api/list");
        assert_eq!(endpoint_key("/api/list"), "/api/list");
    }

    #[test]
    fn test_parse_error_body_shapes() {
        let (code, message) =
            parse_error_body(br#"{"error":"rate_limited"}"#, 429);
        assert_eq!(code.as_deref(), Some("rate_limited"));
        assert_eq!(message, "rate_limited");

        let (code, message) = parse_error_body(
            br#"{"error":{"code":"InvalidAuthenticationToken","message":"Token expired"}}"#,
            401,
        );
        assert_eq!(code.as_deref(), Some("InvalidAuthenticationToken"));
        assert_eq!(message, "Token expired");

        let (code, message) = parse_error_body(b"gateway timeout", 504);
        assert_eq!(code, None);
        assert_eq!(message, "gateway timeout");

        let (code, message) = parse_error_body(b"", 500);
        assert_eq!(code, None);
        assert_eq!(message, "HTTP 500");
    }
}
