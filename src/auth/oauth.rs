//! OAuth 2.0 authorization-code flow: loopback callback listener, PKCE,
//! code exchange, and refresh grants.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::db::schema::ProviderKind;

use super::TokenSet;

/// Default timeout for the OAuth callback (5 minutes).
const OAUTH_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timeout waiting for OAuth callback")]
    Timeout,

    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    #[error("State mismatch")]
    StateMismatch,

    #[error("Callback cancelled")]
    Cancelled,

    #[error("Provider rejected the grant: {0}")]
    Provider(String),

    #[error("Failed to open browser: {0}")]
    Browser(String),
}

/// Static description of one provider's OAuth endpoints.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub provider: ProviderKind,
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_port: u16,
    /// Provider-specific query parameters for the authorize URL (scopes,
    /// audience, prompt). Values are URL-encoded during URL construction.
    pub authorize_params: Vec<(String, String)>,
    pub use_pkce: bool,
}

impl OAuthConfig {
    pub fn redirect_uri(&self) -> String {
        format!(
            "http://localhost:{}/{}/callback",
            self.redirect_port, self.provider
        )
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

pub struct OAuthClient {
    http: reqwest::Client,
    config: OAuthConfig,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Override the token endpoint. Tests point this at a local listener.
    pub fn with_token_url(mut self, token_url: String) -> Self {
        self.config.token_url = token_url;
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Generate a PKCE verifier and its S256 challenge.
    fn generate_pkce() -> (String, String) {
        let mut verifier_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        (verifier, challenge)
    }

    pub fn authorize_url(&self, state: &str, code_challenge: Option<&str>) -> String {
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&state={}",
            self.config.authorize_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri()),
            state,
        );

        for (key, value) in &self.config.authorize_params {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }

        if let Some(challenge) = code_challenge {
            url.push_str("&code_challenge=");
            url.push_str(challenge);
            url.push_str("&code_challenge_method=S256");
        }

        url
    }

    /// Run the full browser dance: bind the loopback listener, open the
    /// authorize URL, wait for the redirect, exchange the code.
    pub async fn start_flow(&self) -> Result<TokenSet, OAuthError> {
        let state = uuid::Uuid::new_v4().to_string();
        let (verifier, challenge) = if self.config.use_pkce {
            let (v, c) = Self::generate_pkce();
            (Some(v), Some(c))
        } else {
            (None, None)
        };

        let auth_url = self.authorize_url(&state, challenge.as_deref());

        // Bind before opening the browser so the redirect cannot race the
        // listener.
        let rx = spawn_callback_listener(self.config.redirect_port, state).await?;

        open::that(&auth_url).map_err(|e| OAuthError::Browser(e.to_string()))?;

        let code = rx.await.map_err(|_| OAuthError::Cancelled)??;

        self.exchange_code(&code, verifier.as_deref()).await
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenSet, OAuthError> {
        let redirect_uri = self.config.redirect_uri();
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await?;

        Self::parse_token_response(response).await
    }

    /// Exchange a refresh token for a new access token. A rejection here is
    /// terminal; the account needs re-authentication.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, OAuthError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        Self::parse_token_response(response).await
    }

    async fn parse_token_response(response: reqwest::Response) -> Result<TokenSet, OAuthError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Provider(format!("HTTP {}: {}", status, body)));
        }

        let parsed: TokenResponse = response.json().await?;

        if let Some(error) = parsed.error {
            let detail = parsed.error_description.unwrap_or_default();
            return Err(OAuthError::Provider(format!("{} {}", error, detail)));
        }

        let now = chrono::Utc::now().timestamp_millis();
        Ok(TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed.expires_in.map(|secs| now + secs * 1000),
            scope: parsed.scope,
            obtained_at: now,
        })
    }
}

/// Bind the loopback listener and return a receiver for the authorization
/// code. The listener is bound before this returns, so opening the browser
/// afterwards cannot race it.
pub async fn spawn_callback_listener(
    port: u16,
    expected_state: String,
) -> Result<oneshot::Receiver<Result<String, OAuthError>>, OAuthError> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;

    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = handle_callback(listener, expected_state, None).await;
        let _ = tx.send(result);
    });

    Ok(rx)
}

async fn handle_callback(
    listener: TcpListener,
    expected_state: String,
    timeout_secs: Option<u64>,
) -> Result<String, OAuthError> {
    let timeout_duration = Duration::from_secs(timeout_secs.unwrap_or(OAUTH_TIMEOUT_SECS));
    let accept_result = timeout(timeout_duration, listener.accept()).await;

    let (mut socket, _) = match accept_result {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return Err(OAuthError::Io(e)),
        Err(_) => return Err(OAuthError::Timeout),
    };

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buffer = [0u8; 2048];
    let bytes_read = socket.read(&mut buffer).await?;

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let (code, state) = parse_callback_request(&request)
        .ok_or_else(|| OAuthError::InvalidCallback("Could not parse callback URL".into()))?;

    if state != expected_state {
        let error_response = build_error_response("State mismatch - possible CSRF attack");
        socket.write_all(error_response.as_bytes()).await?;
        return Err(OAuthError::StateMismatch);
    }

    let success_response = build_success_response();
    socket.write_all(success_response.as_bytes()).await?;

    Ok(code)
}

/// Parse authorization code and state from "GET /path?query HTTP/1.1".
fn parse_callback_request(request: &str) -> Option<(String, String)> {
    let query_start = request.find('?')?;
    let query_end = request[query_start..].find(' ')?;
    let query = &request[query_start + 1..query_start + query_end];

    let params: HashMap<&str, &str> = query
        .split('&')
        .filter_map(|p| {
            let mut parts = p.split('=');
            Some((parts.next()?, parts.next()?))
        })
        .collect();

    let code = params.get("code")?.to_string();
    let state = params.get("state")?.to_string();

    Some((code, state))
}

fn build_success_response() -> String {
    "HTTP/1.1 200 OK\r\n\
     Content-Type: text/html\r\n\
     Connection: close\r\n\r\n\
     <!DOCTYPE html>\
     <html><head><title>Connected</title>\
     <style>body{font-family:system-ui,sans-serif;display:flex;justify-content:center;align-items:center;height:100vh;margin:0;background:#f5f5f5;}\
     .card{background:white;padding:2rem;border-radius:8px;box-shadow:0 2px 10px rgba(0,0,0,0.1);text-align:center;}\
     h1{color:#16a34a;margin-bottom:0.5rem;}p{color:#666;}</style></head>\
     <body><div class='card'><h1>Connected</h1>\
     <p>You can close this window and return to Flow Desk.</p></div></body></html>"
        .to_string()
}

fn build_error_response(message: &str) -> String {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/html\r\n\
         Connection: close\r\n\r\n\
         <!DOCTYPE html>\
         <html><head><title>Connection Failed</title>\
         <style>body{{font-family:system-ui,sans-serif;display:flex;justify-content:center;align-items:center;height:100vh;margin:0;background:#f5f5f5;}}\
         .card{{background:white;padding:2rem;border-radius:8px;box-shadow:0 2px 10px rgba(0,0,0,0.1);text-align:center;}}\
         h1{{color:#dc2626;margin-bottom:0.5rem;}}p{{color:#666;}}</style></head>\
         <body><div class='card'><h1>Connection Failed</h1>\
         <p>{}</p></div></body></html>",
        message
    )
}
