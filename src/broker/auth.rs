//! Bearer-token issuance and refresh.
//!
//! Grounded on `scrapers::dome_rest::DomeRestClient`'s bearer-header client
//! construction, with request signing borrowed from the teacher's HMAC
//! crates (used elsewhere in the teacher for CLOB API auth). The broker's
//! own auth protocol is out of scope per spec §1; this module only
//! implements the contract spec §4.1 requires of a client: "refreshed
//! ahead of expiry under a dedicated single-request-per-second bucket;
//! only one refresh in flight at a time."

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use super::token_bucket::TokenBucket;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
struct Token {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in_secs: u64,
}

/// Issues and refreshes bearer tokens. Exactly one refresh is ever in
/// flight: `refresh_lock` is held across the whole request so concurrent
/// callers observe the same new token rather than each firing their own.
pub struct TokenManager {
    http: Client,
    issue_url: String,
    api_key: String,
    api_secret: String,
    refresh_bucket: Arc<TokenBucket>,
    refresh_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Token>>,
    deadline: Duration,
    refresh_margin: Duration,
}

impl TokenManager {
    pub fn new(issue_url: String, api_key: String, api_secret: String, deadline: Duration) -> Self {
        Self {
            http: Client::builder().timeout(deadline).build().expect("token http client"),
            issue_url,
            api_key,
            api_secret,
            // Spec §4.1: "dedicated single-request-per-second bucket".
            refresh_bucket: Arc::new(TokenBucket::new(1, 1.0)),
            refresh_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            deadline,
            refresh_margin: Duration::from_secs(30),
        }
    }

    fn signature(&self, timestamp: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts key of any length");
        mac.update(format!("{}{}", self.api_key, timestamp).as_bytes());
        let bytes = mac.finalize().into_bytes();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    /// Returns a currently-valid token, refreshing first if necessary or
    /// if the cached token is within `refresh_margin` of expiry.
    pub async fn current_token(&self) -> Result<String> {
        if let Some(token) = self.fresh_cached() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Re-check: another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_cached() {
            return Ok(token);
        }

        self.refresh_bucket.acquire().await;
        self.do_refresh().await
    }

    fn fresh_cached(&self) -> Option<String> {
        let guard = self.current.lock();
        guard.as_ref().and_then(|t| {
            if t.expires_at.saturating_duration_since(Instant::now()) > self.refresh_margin {
                Some(t.value.clone())
            } else {
                None
            }
        })
    }

    async fn do_refresh(&self) -> Result<String> {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let signature = self.signature(&timestamp);

        let resp = self
            .http
            .post(&self.issue_url)
            .header("X-Api-Key", &self.api_key)
            .header("X-Timestamp", &timestamp)
            .header("X-Signature", signature)
            .send()
            .await
            .context("token issuance request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!(%status, "token_refresh_failed");
            anyhow::bail!("token issuance returned {}", status);
        }

        let body: TokenResponse = resp
            .json()
            .await
            .context("failed to parse token response")?;

        let token = Token {
            value: body.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(body.expires_in_secs),
        };
        *self.current.lock() = Some(token);
        info!(expires_in_secs = body.expires_in_secs, "token_refreshed");

        Ok(body.access_token)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}
