//! Broadcast session ids, used only to name the finished file.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::channel::Channel;
use crate::token::TokenAuth;
use crate::{CaptureError, Result};

#[async_trait]
pub trait SessionIdSource: Send + Sync {
    /// Session id of the channel's current broadcast, if one is known.
    async fn current_session_id(&self, channel: &Channel) -> Result<Option<String>>;
}

/// Never knows a session id; finished files are named by date.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSessionSource;

#[async_trait]
impl SessionIdSource for NoSessionSource {
    async fn current_session_id(&self, _channel: &Channel) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Looks the id up in a JSON API, e.g. Helix
/// `https://api.twitch.tv/helix/streams?user_login={channel}` with pointer
/// `/data/0/id`.
pub struct HttpSessionSource {
    client: Client,
    url_template: String,
    pointer: String,
    auth: Option<TokenAuth>,
}

impl HttpSessionSource {
    pub fn new(client: Client, url_template: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            client,
            url_template: url_template.into(),
            pointer: pointer.into(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: TokenAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(auth) = &self.auth {
            request = auth.authorize(request).await?;
        }
        Ok(request.send().await?)
    }
}

fn extract_id(body: &Value, pointer: &str) -> Option<String> {
    match body.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SessionIdSource for HttpSessionSource {
    async fn current_session_id(&self, channel: &Channel) -> Result<Option<String>> {
        let url = self.url_template.replace("{channel}", &channel.name);
        let mut response = self.send(&url).await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && let Some(auth) = &self.auth
        {
            auth.reject().await;
            response = self.send(&url).await?;
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CaptureError::http_status(status, url, "session lookup"));
        }

        let body: Value = response.json().await?;
        Ok(extract_id(&body, &self.pointer))
    }
}

/// Background poller that keeps asking for the session id until it is known.
pub struct SessionWatcher {
    rx: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SessionWatcher {
    /// Start polling for `channel`. A known `initial` id is used as is.
    pub fn spawn(
        source: Arc<dyn SessionIdSource>,
        channel: Channel,
        interval: Duration,
        initial: Option<String>,
    ) -> Self {
        let (tx, rx) = watch::channel(initial.clone());
        let cancel = CancellationToken::new();
        if initial.is_some() {
            return Self {
                rx,
                cancel,
                handle: None,
            };
        }

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                match source.current_session_id(&channel).await {
                    Ok(Some(id)) => {
                        info!(%channel, session_id = %id, "Session id resolved");
                        let _ = tx.send(Some(id));
                        return;
                    }
                    Ok(None) => trace!(%channel, "Session id not available yet"),
                    Err(e) => debug!(%channel, error = %e, "Session id lookup failed"),
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Self {
            rx,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Wait up to `grace` for the id, then return whatever is known.
    pub async fn wait(&mut self, grace: Duration) -> Option<String> {
        if let Some(id) = self.current() {
            return Some(id);
        }
        let found = match tokio::time::timeout(grace, self.rx.wait_for(Option::is_some)).await {
            Ok(Ok(id)) => id.clone(),
            _ => None,
        };
        found.or_else(|| self.current())
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Platform;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Answers after a number of empty polls.
    struct LateSource {
        polls: AtomicU32,
        answer_after: u32,
    }

    #[async_trait]
    impl SessionIdSource for LateSource {
        async fn current_session_id(&self, _channel: &Channel) -> Result<Option<String>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok((n >= self.answer_after).then(|| "314".to_string()))
        }
    }

    fn channel() -> Channel {
        Channel::new("alice", Platform::Twitch)
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_picks_up_late_session_id() {
        let source = Arc::new(LateSource {
            polls: AtomicU32::new(0),
            answer_after: 3,
        });
        let mut watcher =
            SessionWatcher::spawn(source.clone(), channel(), Duration::from_secs(5), None);
        assert_eq!(watcher.wait(Duration::from_secs(60)).await.as_deref(), Some("314"));
        assert_eq!(source.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_after_grace() {
        let mut watcher = SessionWatcher::spawn(
            Arc::new(NoSessionSource),
            channel(),
            Duration::from_secs(5),
            None,
        );
        assert_eq!(watcher.wait(Duration::from_secs(10)).await, None);
    }

    #[tokio::test]
    async fn known_id_is_returned_without_polling() {
        let source = Arc::new(LateSource {
            polls: AtomicU32::new(0),
            answer_after: 0,
        });
        let mut watcher = SessionWatcher::spawn(
            source.clone(),
            channel(),
            Duration::from_secs(5),
            Some("99".into()),
        );
        assert_eq!(watcher.wait(Duration::ZERO).await.as_deref(), Some("99"));
        assert_eq!(source.polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pointer_accepts_strings_and_numbers() {
        let body = serde_json::json!({"data": [{"id": "123"}], "n": {"id": 7}, "empty": {"data": []}});
        assert_eq!(extract_id(&body, "/data/0/id").as_deref(), Some("123"));
        assert_eq!(extract_id(&body, "/n/id").as_deref(), Some("7"));
        assert_eq!(extract_id(&body, "/empty/data/0/id"), None);
    }

    #[tokio::test]
    async fn http_source_reads_helix_style_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/streams"))
            .and(query_param("user_login", "alice"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": [{"id": "40123456789"}]})),
            )
            .mount(&server)
            .await;

        let source = HttpSessionSource::new(
            Client::new(),
            format!("{}/helix/streams?user_login={{channel}}", server.uri()),
            "/data/0/id",
        );
        let id = source.current_session_id(&channel()).await.unwrap();
        assert_eq!(id.as_deref(), Some("40123456789"));
    }
}
