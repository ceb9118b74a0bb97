//! HTTP playlist resolution: templated URL -> (master ->) media playlist.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use tracing::{debug, trace, warn};
use url::Url;

use super::playlist::{
    ParsedPlaylist, PlaylistResolver, PlaylistStatus, parse_playlist, select_variant,
};
use crate::channel::{Channel, Platform};
use crate::token::TokenAuth;
use crate::{CaptureError, Result};

/// Maps a channel to the URL of its (master or media) playlist.
#[async_trait]
pub trait PlaylistUrlProvider: Send + Sync {
    async fn playlist_url(&self, channel: &Channel) -> Result<String>;
}

/// Per-platform URL templates with `{channel}` placeholders, plus explicit
/// per-channel URLs that take precedence.
#[derive(Debug, Clone, Default)]
pub struct StaticUrlProvider {
    templates: HashMap<Platform, String>,
    overrides: HashMap<String, String>,
}

impl StaticUrlProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, platform: Platform, template: impl Into<String>) -> Self {
        self.templates.insert(platform, template.into());
        self
    }

    pub fn with_channel_url(mut self, channel: &Channel, url: impl Into<String>) -> Self {
        self.overrides.insert(channel.key(), url.into());
        self
    }

    pub fn url_for(&self, channel: &Channel) -> Result<String> {
        if let Some(url) = self.overrides.get(&channel.key()) {
            return Ok(url.clone());
        }
        self.templates
            .get(&channel.platform)
            .map(|template| template.replace("{channel}", &channel.name))
            .ok_or_else(|| {
                CaptureError::configuration(format!("no playlist URL configured for {channel}"))
            })
    }
}

#[async_trait]
impl PlaylistUrlProvider for StaticUrlProvider {
    async fn playlist_url(&self, channel: &Channel) -> Result<String> {
        self.url_for(channel)
    }
}

enum Fetched {
    Body(Bytes),
    Gone,
}

pub struct HttpPlaylistResolver {
    client: Client,
    urls: Arc<dyn PlaylistUrlProvider>,
    /// Token sent with playlist requests, per platform.
    auth: HashMap<Platform, TokenAuth>,
    /// Media playlist chosen from a master playlist, per channel key.
    media_urls: DashMap<String, String>,
}

impl HttpPlaylistResolver {
    pub fn new(client: Client, urls: Arc<dyn PlaylistUrlProvider>) -> Self {
        Self {
            client,
            urls,
            auth: HashMap::new(),
            media_urls: DashMap::new(),
        }
    }

    pub fn with_auth(mut self, platform: Platform, auth: TokenAuth) -> Self {
        self.auth.insert(platform, auth);
        self
    }

    async fn send(&self, channel: &Channel, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(auth) = self.auth.get(&channel.platform) {
            request = auth.authorize(request).await?;
        }
        Ok(request.send().await?)
    }

    async fn fetch(&self, channel: &Channel, url: &str) -> Result<Fetched> {
        let mut response = self.send(channel, url).await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && let Some(auth) = self.auth.get(&channel.platform)
        {
            debug!(%channel, url, "Playlist request unauthorized, refreshing token");
            auth.reject().await;
            response = self.send(channel, url).await?;
        }

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(Fetched::Gone),
            status if status.is_success() => Ok(Fetched::Body(response.bytes().await?)),
            status => Err(CaptureError::http_status(status, url, "playlist fetch")),
        }
    }

    async fn resolve(&self, channel: &Channel) -> Result<PlaylistStatus> {
        let key = channel.key();

        if let Some(media_url) = self.media_urls.get(&key).map(|u| u.clone()) {
            match self.fetch(channel, &media_url).await? {
                Fetched::Body(body) => {
                    if let ParsedPlaylist::Media(playlist) = parse(&body, &media_url)? {
                        return Ok(PlaylistStatus::Live(playlist));
                    }
                }
                Fetched::Gone => {}
            }
            debug!(%channel, "Cached media playlist is gone, re-resolving");
            self.media_urls.remove(&key);
        }

        let url = self.urls.playlist_url(channel).await?;
        let body = match self.fetch(channel, &url).await? {
            Fetched::Body(body) => body,
            Fetched::Gone => return Ok(PlaylistStatus::Ended),
        };

        match parse(&body, &url)? {
            ParsedPlaylist::Media(playlist) => Ok(PlaylistStatus::Live(playlist)),
            ParsedPlaylist::Master(variants) => {
                let variant = select_variant(&variants).ok_or_else(|| {
                    CaptureError::playlist_unavailable(channel, "master playlist has no variants")
                })?;
                trace!(%channel, uri = %variant.uri, bandwidth = variant.bandwidth, "Selected variant");

                let body = match self.fetch(channel, &variant.uri).await? {
                    Fetched::Body(body) => body,
                    Fetched::Gone => return Ok(PlaylistStatus::Ended),
                };
                match parse(&body, &variant.uri)? {
                    ParsedPlaylist::Media(playlist) => {
                        self.media_urls.insert(key, variant.uri.clone());
                        Ok(PlaylistStatus::Live(playlist))
                    }
                    ParsedPlaylist::Master(_) => Err(CaptureError::playlist_unavailable(
                        channel,
                        "variant resolved to another master playlist",
                    )),
                }
            }
        }
    }
}

fn parse(body: &[u8], url: &str) -> Result<ParsedPlaylist> {
    let url = Url::parse(url).map_err(|e| {
        CaptureError::configuration(format!("invalid playlist URL {url}: {e}"))
    })?;
    parse_playlist(body, &url)
}

#[async_trait]
impl PlaylistResolver for HttpPlaylistResolver {
    async fn resolve_playlist(&self, channel: &Channel) -> Result<PlaylistStatus> {
        self.resolve(channel).await.map_err(|e| match e {
            e @ (CaptureError::PlaylistUnavailable { .. } | CaptureError::Configuration { .. }) => e,
            other => {
                warn!(%channel, error = %other, "Playlist resolution failed");
                CaptureError::playlist_unavailable(channel, other.to_string())
            }
        })
    }
}
