//! Per-credential access tokens with single-flight refresh.
//!
//! Each credential key owns one slot guarded by an async mutex. A caller that
//! finds the token missing or about to expire refreshes it while holding the
//! lock; everyone queued behind it sees the fresh token once the lock is
//! released, so concurrent callers trigger exactly one refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{CaptureError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    /// `None` means the token never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => {
                let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
                now + skew < expires_at
            }
        }
    }
}

/// Obtains a new token for a credential key.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, key: &str) -> Result<Token>;
}

type Slot = Arc<Mutex<Option<Token>>>;

pub struct TokenManager {
    refresher: Arc<dyn TokenRefresher>,
    slots: DashMap<String, Slot>,
    /// Tokens expiring within this window are refreshed early.
    skew: Duration,
}

impl TokenManager {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            refresher,
            slots: DashMap::new(),
            skew: Duration::from_secs(60),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Return a valid token for `key`, refreshing it if needed.
    pub async fn get_or_refresh(&self, key: &str) -> Result<Token> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(token) = guard.as_ref()
            && token.is_fresh(Utc::now(), self.skew)
        {
            return Ok(token.clone());
        }

        debug!(key, "Refreshing access token");
        let token = self.refresher.refresh(key).await.inspect_err(|e| {
            warn!(key, error = %e, "Access token refresh failed");
        })?;
        info!(key, expires_at = ?token.expires_at, "Access token refreshed");
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token so the next caller refreshes it.
    pub async fn invalidate(&self, key: &str) {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if guard.take().is_some() {
            debug!(key, "Access token invalidated");
        }
    }
}

/// Attaches a managed bearer token (and optional client id) to requests.
#[derive(Clone)]
pub struct TokenAuth {
    manager: Arc<TokenManager>,
    key: String,
    client_id: Option<String>,
}

impl TokenAuth {
    pub fn new(manager: Arc<TokenManager>, key: impl Into<String>) -> Self {
        Self {
            manager,
            key: key.into(),
            client_id: None,
        }
    }

    /// Send `Client-Id` alongside the token, as Helix requires.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.manager.get_or_refresh(&self.key).await?;
        let request = request.bearer_auth(token.value);
        Ok(match &self.client_id {
            Some(id) => request.header("Client-Id", id),
            None => request,
        })
    }

    /// Called after an HTTP 401 so the next request carries a new token.
    pub async fn reject(&self) {
        self.manager.invalidate(&self.key).await;
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// OAuth2 client-credentials grant, e.g. Twitch app access tokens.
pub struct OAuthClientCredentialsRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthClientCredentialsRefresher {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl TokenRefresher for OAuthClientCredentialsRefresher {
    async fn refresh(&self, key: &str) -> Result<Token> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CaptureError::credential(format!(
                "token endpoint returned HTTP {status} for {key}"
            )));
        }

        let body: OAuthTokenResponse = response.json().await?;
        if body.access_token.is_empty() {
            return Err(CaptureError::credential(format!(
                "token endpoint returned an empty access token for {key}"
            )));
        }

        let expires_at = body
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Ok(Token::new(body.access_token, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _key: &str) -> Result<Token> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Token::new(format!("token-{n}"), Some(Utc::now() + self.lifetime)))
        }
    }

    fn manager(lifetime: chrono::Duration) -> (Arc<CountingRefresher>, Arc<TokenManager>) {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            lifetime,
        });
        let manager = Arc::new(TokenManager::new(refresher.clone()));
        (refresher, manager)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let (refresher, manager) = manager(chrono::Duration::hours(1));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(
                async move { manager.get_or_refresh("twitch").await },
            ));
        }
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.value, "token-0");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keys_refresh_independently() {
        let (refresher, manager) = manager(chrono::Duration::hours(1));
        manager.get_or_refresh("twitch").await.unwrap();
        manager.get_or_refresh("kick").await.unwrap();
        manager.get_or_refresh("twitch").await.unwrap();
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn token_inside_skew_window_is_refreshed() {
        // Lifetime shorter than the default 60s skew.
        let (refresher, manager) = manager(chrono::Duration::seconds(30));
        manager.get_or_refresh("twitch").await.unwrap();
        let second = manager.get_or_refresh("twitch").await.unwrap();
        assert_eq!(second.value, "token-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let (refresher, manager) = manager(chrono::Duration::hours(1));
        manager.get_or_refresh("twitch").await.unwrap();
        manager.invalidate("twitch").await;
        let token = manager.get_or_refresh("twitch").await.unwrap();
        assert_eq!(token.value, "token-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn token_without_expiry_is_always_fresh() {
        let token = Token::new("x", None);
        assert!(token.is_fresh(Utc::now(), Duration::from_secs(3600)));
    }
}
