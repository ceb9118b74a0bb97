//! Playlist model and parsing on top of m3u8-rs.

use async_trait::async_trait;
use m3u8_rs::parse_playlist_res;
use url::Url;

use crate::channel::Channel;
use crate::{CaptureError, Result};

/// One media segment. Identity across refreshes is the exact `uri`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Absolute segment URL.
    pub uri: String,
    /// Media sequence number as advertised by the playlist.
    pub sequence_index: u64,
    /// EXTINF duration in seconds.
    pub duration: f32,
}

impl Segment {
    pub fn new(uri: impl Into<String>, sequence_index: u64) -> Self {
        Self {
            uri: uri.into(),
            sequence_index,
            duration: 0.0,
        }
    }
}

/// Segments currently advertised by a media playlist, in playback order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaPlaylist {
    pub segments: Vec<Segment>,
    /// `#EXT-X-ENDLIST` was present.
    pub end_of_stream: bool,
}

impl MediaPlaylist {
    pub fn new(segments: Vec<Segment>, end_of_stream: bool) -> Self {
        Self {
            segments,
            end_of_stream,
        }
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.segments.iter().any(|s| s.uri == uri)
    }
}

/// Variant stream of a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: u64,
    /// `VIDEO` rendition group, e.g. `chunked` for Twitch source quality.
    pub video: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPlaylist {
    Master(Vec<Variant>),
    Media(MediaPlaylist),
}

/// Outcome of asking for a channel's current playlist.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistStatus {
    Live(MediaPlaylist),
    /// The broadcast is over or the channel is offline.
    Ended,
}

/// Gives the capture loop the current media playlist of a channel.
#[async_trait]
pub trait PlaylistResolver: Send + Sync {
    async fn resolve_playlist(&self, channel: &Channel) -> Result<PlaylistStatus>;

    async fn is_live(&self, channel: &Channel) -> Result<bool> {
        Ok(match self.resolve_playlist(channel).await? {
            PlaylistStatus::Live(playlist) => !playlist.end_of_stream,
            PlaylistStatus::Ended => false,
        })
    }
}

fn resolve_uri(base: &Url, uri: &str) -> Result<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    base.join(uri)
        .map(|u| u.to_string())
        .map_err(|e| CaptureError::playlist_unavailable(base.as_str(), format!("invalid URI {uri}: {e}")))
}

/// Parse playlist bytes fetched from `playlist_url`; relative URIs are
/// resolved against it.
pub fn parse_playlist(bytes: &[u8], playlist_url: &Url) -> Result<ParsedPlaylist> {
    let parsed = parse_playlist_res(bytes).map_err(|e| {
        CaptureError::playlist_unavailable(playlist_url.as_str(), format!("unparsable playlist: {e}"))
    })?;

    match parsed {
        m3u8_rs::Playlist::MasterPlaylist(pl) => {
            let variants = pl
                .variants
                .iter()
                .filter(|v| !v.is_i_frame)
                .map(|v| {
                    Ok(Variant {
                        uri: resolve_uri(playlist_url, &v.uri)?,
                        bandwidth: v.bandwidth,
                        video: v.video.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ParsedPlaylist::Master(variants))
        }
        m3u8_rs::Playlist::MediaPlaylist(pl) => {
            let segments = pl
                .segments
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    Ok(Segment {
                        uri: resolve_uri(playlist_url, &s.uri)?,
                        sequence_index: pl.media_sequence + i as u64,
                        duration: s.duration,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ParsedPlaylist::Media(MediaPlaylist {
                segments,
                end_of_stream: pl.end_list,
            }))
        }
    }
}

/// Prefer the source-quality (`VIDEO="chunked"`) rendition, otherwise the
/// highest bandwidth one.
pub fn select_variant(variants: &[Variant]) -> Option<&Variant> {
    variants
        .iter()
        .find(|v| v.video.as_deref() == Some("chunked"))
        .or_else(|| variants.iter().max_by_key(|v| v.bandwidth))
}
