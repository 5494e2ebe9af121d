//! Per-endpoint rate-limit state and request gating.
//!
//! Quota headers from each response are recorded per endpoint key; before a
//! request goes out, callers wait until any retry-after deadline (or an
//! exhausted quota window) has passed. Concurrent callers to the same
//! endpoint all wait on the one shared deadline instead of stacking
//! independent timers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::time::Instant;

/// Fallback when a 429 arrives without a Retry-After header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Default)]
pub struct EndpointState {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
    pub retry_after: Option<Instant>,
}

#[derive(Default)]
pub struct RateLimiter {
    state: Mutex<HashMap<String, EndpointState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the endpoint is dispatchable. Returns immediately when no
    /// deadline is pending. Requests are delayed, never dropped.
    pub async fn before_request(&self, endpoint_key: &str) {
        loop {
            let deadline = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let Some(entry) = state.get_mut(endpoint_key) else {
                    return;
                };

                let now = Instant::now();

                if let Some(retry_after) = entry.retry_after {
                    if retry_after > now {
                        Some(retry_after)
                    } else {
                        entry.retry_after = None;
                        None
                    }
                } else {
                    None
                }
                .or_else(|| match (entry.remaining, entry.reset_at) {
                    (Some(0), Some(reset_at)) if reset_at > now => Some(reset_at),
                    (Some(0), Some(_)) => {
                        // Window rolled over while we were away.
                        entry.remaining = None;
                        entry.reset_at = None;
                        None
                    }
                    _ => None,
                })
            };

            match deadline {
                None => return,
                Some(deadline) => {
                    tracing::debug!(
                        "Rate limit wait on {}: {:?}",
                        endpoint_key,
                        deadline.saturating_duration_since(Instant::now())
                    );
                    tokio::time::sleep_until(deadline).await;
                    // Re-check: the deadline may have been extended by a
                    // response that landed while we slept.
                }
            }
        }
    }

    /// Record quota headers and throttle deadlines from a response.
    pub fn after_response(&self, endpoint_key: &str, status: u16, headers: &HeaderMap) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(endpoint_key.to_string()).or_default();
        let now = Instant::now();

        if let Some(limit) = parse_numeric_header(headers, "x-ratelimit-limit") {
            entry.limit = Some(limit as u32);
        }
        if let Some(remaining) = parse_numeric_header(headers, "x-ratelimit-remaining") {
            entry.remaining = Some(remaining as u32);
        }
        if let Some(reset) = parse_numeric_header(headers, "x-ratelimit-reset") {
            // Providers disagree on epoch seconds vs. delta seconds. No
            // delta window is ever a billion seconds, so anything that
            // large is an epoch; a past epoch means the window already
            // rolled over.
            const EPOCH_THRESHOLD: i64 = 1_000_000_000;
            let delta_secs = if reset >= EPOCH_THRESHOLD {
                (reset - chrono::Utc::now().timestamp()).max(0) as u64
            } else {
                reset.max(0) as u64
            };
            entry.reset_at = Some(now + Duration::from_secs(delta_secs));
        }

        if status == 429 {
            let retry_secs = parse_numeric_header(headers, "retry-after")
                .map(|s| s.max(0) as u64)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            entry.retry_after = Some(now + Duration::from_secs(retry_secs));
            tracing::warn!(
                "Throttled on {}: backing off {}s",
                endpoint_key,
                retry_secs
            );
        }
    }

    /// Current state for an endpoint, if any request has touched it.
    pub fn snapshot(&self, endpoint_key: &str) -> Option<EndpointState> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.get(endpoint_key).cloned()
    }
}

fn parse_numeric_header(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .map(|v| v as i64)
}
