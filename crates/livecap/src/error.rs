use std::path::{Path, PathBuf};

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture cancelled")]
    Cancelled,

    #[error("playlist unavailable for {channel}: {reason}")]
    PlaylistUnavailable { channel: String, reason: String },

    #[error("segment fetch failed for {uri}: {reason}")]
    SegmentFetch {
        uri: String,
        reason: String,
        retryable: bool,
    },

    #[error("batch merge failed: {reason}")]
    MergeFailed { reason: String },

    #[error("append to {path} failed: {reason}")]
    AppendFailed { path: PathBuf, reason: String },

    #[error("session id unresolved for {channel}")]
    SessionIdUnresolved { channel: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error while {op} `{}`: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run state error: {source}")]
    State {
        #[from]
        source: serde_json::Error,
    },

    #[error("upload hand-off failed: {reason}")]
    UploadFailed { reason: String },

    #[error("credential error: {reason}")]
    Credential { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl CaptureError {
    pub fn playlist_unavailable(channel: impl ToString, reason: impl Into<String>) -> Self {
        Self::PlaylistUnavailable {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }

    pub fn merge_failed(reason: impl Into<String>) -> Self {
        Self::MergeFailed {
            reason: reason.into(),
        }
    }

    pub fn append_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::AppendFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn credential(reason: impl Into<String>) -> Self {
        Self::Credential {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether repeating the same operation later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::Configuration { .. }
            | Self::Credential { .. }
            | Self::State { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::PlaylistUnavailable { .. }
            | Self::MergeFailed { .. }
            | Self::AppendFailed { .. }
            | Self::SessionIdUnresolved { .. }
            | Self::UploadFailed { .. }
            | Self::Io { .. } => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        let err = CaptureError::http_status(StatusCode::BAD_GATEWAY, "http://x", "segment");
        assert!(err.is_retryable());
        let err = CaptureError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://x", "segment");
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = CaptureError::http_status(StatusCode::FORBIDDEN, "http://x", "segment");
        assert!(!err.is_retryable());
        assert!(!CaptureError::configuration("bad").is_retryable());
    }

    #[test]
    fn io_error_mentions_operation_and_path() {
        let err = CaptureError::io_path(
            "renaming output",
            Path::new("/tmp/out.ts"),
            std::io::Error::other("boom"),
        );
        let msg = err.to_string();
        assert!(msg.contains("renaming output"));
        assert!(msg.contains("/tmp/out.ts"));
    }
}
