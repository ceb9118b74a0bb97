//! Wires the configured services into a supervisor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use livecap_engine::{
    CaptureEngine, Channel, ChannelMonitor, CommandUploadSink, ConcatMerger, FfmpegMerger,
    HttpClientConfig, HttpPlaylistResolver, HttpSegmentSource, HttpSessionSource,
    LoggingUploadSink, OAuthClientCredentialsRefresher, Platform, SessionIdSource,
    StaticUrlProvider, StreamMerger, Supervisor, TokenAuth, TokenManager, UploadSink,
};
use tracing::info;

use crate::config::{AppConfig, MergerKind};
use crate::error::Result;

/// Key of the single app access token.
const APP_TOKEN_KEY: &str = "app";

/// Routes session lookups to the source configured for the channel's platform.
#[derive(Default)]
pub struct PlatformSessionSource {
    sources: HashMap<Platform, Arc<dyn SessionIdSource>>,
}

impl PlatformSessionSource {
    pub fn with_source(mut self, platform: Platform, source: Arc<dyn SessionIdSource>) -> Self {
        self.sources.insert(platform, source);
        self
    }
}

#[async_trait]
impl SessionIdSource for PlatformSessionSource {
    async fn current_session_id(&self, channel: &Channel) -> livecap_engine::Result<Option<String>> {
        match self.sources.get(&channel.platform) {
            Some(source) => source.current_session_id(channel).await,
            None => Ok(None),
        }
    }
}

fn build_merger(config: &AppConfig) -> Arc<dyn StreamMerger> {
    match config.merger {
        MergerKind::Ffmpeg => Arc::new(FfmpegMerger::new(config.ffmpeg_path.clone())),
        MergerKind::Concat => Arc::new(ConcatMerger),
    }
}

fn build_url_provider(config: &AppConfig) -> StaticUrlProvider {
    let provider = config
        .playlists
        .iter()
        .fold(StaticUrlProvider::new(), |provider, p| {
            provider.with_template(p.platform, p.url_template.clone())
        });

    config.channels.iter().fold(provider, |provider, c| match &c.playlist_url {
        Some(url) => provider.with_channel_url(&c.channel(), url.clone()),
        None => provider,
    })
}

fn build_upload_sink(config: &AppConfig) -> Arc<dyn UploadSink> {
    match &config.upload {
        Some(upload) => Arc::new(CommandUploadSink::new(upload.command.clone(), upload.args.clone())),
        None => Arc::new(LoggingUploadSink),
    }
}

/// Build one monitor per configured channel, sharing a single engine.
pub fn build_supervisor(config: &AppConfig) -> Result<Supervisor> {
    let mut http = HttpClientConfig::default();
    if let Some(user_agent) = &config.user_agent {
        http.user_agent = user_agent.clone();
    }
    let client = http.build_client()?;

    let auth = config.auth.as_ref().map(|auth| {
        let refresher = OAuthClientCredentialsRefresher::new(
            client.clone(),
            auth.token_url.clone(),
            auth.client_id.clone(),
            auth.client_secret.clone(),
        );
        let manager = Arc::new(TokenManager::new(Arc::new(refresher)));
        TokenAuth::new(manager, APP_TOKEN_KEY).with_client_id(auth.client_id.clone())
    });

    let resolver = config.playlists.iter().filter(|p| p.use_auth).fold(
        HttpPlaylistResolver::new(client.clone(), Arc::new(build_url_provider(config))),
        |resolver, p| match &auth {
            Some(auth) => resolver.with_auth(p.platform, auth.clone()),
            None => resolver,
        },
    );

    let sessions = config.sessions.iter().fold(PlatformSessionSource::default(), |sessions, s| {
        let mut source = HttpSessionSource::new(client.clone(), s.url_template.clone(), s.pointer.clone());
        if s.use_auth
            && let Some(auth) = &auth
        {
            source = source.with_auth(auth.clone());
        }
        sessions.with_source(s.platform, Arc::new(source))
    });

    let engine = CaptureEngine::new(
        config.capture_config(),
        Arc::new(resolver),
        Arc::new(HttpSegmentSource::new(client, http.transport_retries)),
        build_merger(config),
    )
    .with_session_source(Arc::new(sessions))
    .with_upload_sink(build_upload_sink(config));
    let engine = Arc::new(engine);

    let mut supervisor = Supervisor::new();
    for channel in &config.channels {
        supervisor.add(ChannelMonitor::new(
            channel.channel(),
            engine.clone(),
            config.monitor_config(),
        ));
    }

    info!(
        channels = supervisor.len(),
        merger = ?config.merger,
        output_dir = %config.output_dir.display(),
        "Supervisor ready"
    );
    Ok(supervisor)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl SessionIdSource for Fixed {
        async fn current_session_id(&self, _channel: &Channel) -> livecap_engine::Result<Option<String>> {
            Ok(Some(self.0.to_string()))
        }
    }

    fn config(text: &str) -> AppConfig {
        let config = AppConfig::parse(text).unwrap();
        config.validate().unwrap();
        config
    }

    #[tokio::test]
    async fn session_lookups_follow_the_platform() {
        let sessions = PlatformSessionSource::default().with_source(Platform::Twitch, Arc::new(Fixed("42")));

        let twitch = Channel::new("alice", Platform::Twitch);
        let kick = Channel::new("bob", Platform::Kick);
        assert_eq!(sessions.current_session_id(&twitch).await.unwrap().as_deref(), Some("42"));
        assert_eq!(sessions.current_session_id(&kick).await.unwrap(), None);
    }

    #[test]
    fn channel_url_overrides_platform_template() {
        let config = config(
            r#"
[[playlists]]
platform = "hls"
url_template = "https://cdn.example.com/{channel}/index.m3u8"

[[channels]]
name = "alice"
platform = "hls"

[[channels]]
name = "bob"
platform = "hls"
playlist_url = "https://other.example.com/bob.m3u8"
"#,
        );
        let provider = build_url_provider(&config);

        let alice = Channel::new("alice", Platform::Hls);
        let bob = Channel::new("bob", Platform::Hls);
        assert_eq!(
            provider.url_for(&alice).unwrap(),
            "https://cdn.example.com/alice/index.m3u8"
        );
        assert_eq!(provider.url_for(&bob).unwrap(), "https://other.example.com/bob.m3u8");
    }

    #[tokio::test]
    async fn authenticated_playlists_build() {
        let config = config(
            r#"
[auth]
token_url = "https://id.example.com/token"
client_id = "abc"
client_secret = "def"

[[playlists]]
platform = "twitch"
url_template = "https://usher.example.com/{channel}.m3u8"
use_auth = true

[[channels]]
name = "alice"
platform = "twitch"
"#,
        );
        let supervisor = build_supervisor(&config).unwrap();
        assert_eq!(supervisor.len(), 1);
    }

    #[tokio::test]
    async fn one_monitor_per_channel() {
        let config = config(
            r#"
merger = "concat"

[[channels]]
name = "alice"
platform = "hls"
playlist_url = "https://a.example.com/alice.m3u8"

[[channels]]
name = "bob"
platform = "kick"
playlist_url = "https://a.example.com/bob.m3u8"
"#,
        );
        let supervisor = build_supervisor(&config).unwrap();
        assert_eq!(supervisor.len(), 2);
    }
}
