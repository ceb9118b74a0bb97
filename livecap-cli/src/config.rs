//! TOML configuration file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use livecap_engine::{CaptureConfig, Channel, FinalFormat, MonitorConfig, Platform, RetryPolicy};
use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergerKind {
    #[default]
    Ffmpeg,
    Concat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Ts,
    Mp4,
}

/// OAuth client-credentials app token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

fn default_token_url() -> String {
    "https://id.twitch.tv/oauth2/token".to_string()
}

/// Playlist URL template for one platform; `{channel}` is substituted.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistConfig {
    pub platform: Platform,
    pub url_template: String,
    /// Send the `[auth]` app token with playlist requests.
    #[serde(default)]
    pub use_auth: bool,
}

/// Session id lookup for one platform.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub platform: Platform,
    pub url_template: String,
    /// JSON pointer to the id, e.g. `/data/0/id`
    pub pointer: String,
    /// Send the `[auth]` app token with the lookup.
    #[serde(default)]
    pub use_auth: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub platform: Platform,
    /// Overrides the platform template.
    #[serde(default)]
    pub playlist_url: Option<String>,
}

impl ChannelConfig {
    pub fn channel(&self) -> Channel {
        Channel::new(self.name.clone(), self.platform)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_dir: PathBuf,
    pub check_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub failure_backoff_secs: u64,
    pub playlist_max_failures: u32,
    pub segment_max_attempts: u32,
    pub append_max_attempts: u32,
    pub session_grace_secs: u64,
    pub merger: MergerKind,
    pub final_format: OutputFormat,
    pub ffmpeg_path: PathBuf,
    pub user_agent: Option<String>,
    pub date_format: String,
    pub auth: Option<AuthConfig>,
    pub playlists: Vec<PlaylistConfig>,
    pub sessions: Vec<SessionConfig>,
    pub upload: Option<UploadConfig>,
    pub channels: Vec<ChannelConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            output_dir: capture.output_dir,
            check_interval_secs: MonitorConfig::default().check_interval.as_secs(),
            poll_interval_secs: capture.poll_interval.as_secs(),
            failure_backoff_secs: capture.failure_backoff.as_secs(),
            playlist_max_failures: capture.playlist_max_failures,
            segment_max_attempts: capture.segment_retry.max_attempts,
            append_max_attempts: capture.append_max_attempts,
            session_grace_secs: capture.session_grace.as_secs(),
            merger: MergerKind::default(),
            final_format: OutputFormat::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            user_agent: None,
            date_format: capture.date_format,
            auth: None,
            playlists: Vec::new(),
            sessions: Vec::new(),
            upload: None,
            channels: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text).map_err(|source| AppError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(AppError::InvalidConfig("no channels configured".into()));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(AppError::InvalidConfig("channel with an empty name".into()));
            }
            if !seen.insert((channel.platform, channel.name.to_lowercase())) {
                return Err(AppError::InvalidConfig(format!(
                    "channel {} is configured twice",
                    channel.channel()
                )));
            }
            let has_template = self.playlists.iter().any(|p| p.platform == channel.platform);
            if channel.playlist_url.is_none() && !has_template {
                return Err(AppError::InvalidConfig(format!(
                    "no playlist URL for {}: set `playlist_url` or a [[playlists]] template",
                    channel.channel()
                )));
            }
        }

        if self.final_format == OutputFormat::Mp4 && self.merger != MergerKind::Ffmpeg {
            return Err(AppError::InvalidConfig(
                "MP4 finalization requires the ffmpeg merger".into(),
            ));
        }

        if self.sessions.iter().any(|s| s.use_auth) && self.auth.is_none() {
            return Err(AppError::InvalidConfig(
                "a session lookup uses auth but [auth] is missing".into(),
            ));
        }
        if self.playlists.iter().any(|p| p.use_auth) && self.auth.is_none() {
            return Err(AppError::InvalidConfig(
                "a playlist template uses auth but [auth] is missing".into(),
            ));
        }

        if self.check_interval_secs == 0 || self.poll_interval_secs == 0 {
            return Err(AppError::InvalidConfig("intervals must be at least 1 second".into()));
        }

        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        let defaults = CaptureConfig::default();
        CaptureConfig {
            output_dir: self.output_dir.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            failure_backoff: Duration::from_secs(self.failure_backoff_secs),
            playlist_max_failures: self.playlist_max_failures,
            segment_retry: RetryPolicy {
                max_attempts: self.segment_max_attempts,
                ..RetryPolicy::default()
            },
            append_max_attempts: self.append_max_attempts,
            session_grace: Duration::from_secs(self.session_grace_secs),
            final_format: match self.final_format {
                OutputFormat::Ts => FinalFormat::Ts,
                OutputFormat::Mp4 => FinalFormat::Mp4,
            },
            date_format: self.date_format.clone(),
            ..defaults
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
        }
    }
}
