use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Container the finished capture is handed off in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FinalFormat {
    /// Keep the assembled MPEG-TS file as is.
    #[default]
    Ts,
    /// Stream-copy the assembled file into an MP4 container on finalize.
    Mp4,
}

impl FinalFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ts => "ts",
            Self::Mp4 => "mp4",
        }
    }
}

/// Options for the shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Timeout for a single playlist or segment request
    pub request_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Extra headers sent with every request
    pub headers: HeaderMap,

    /// Immediate reconnect attempts performed by the transport for connect errors
    pub transport_retries: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpClientConfig::get_default_headers(),
            transport_retries: 2,
        }
    }
}

impl HttpClientConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers
    }

    /// Build a reqwest client from this configuration.
    pub fn build_client(&self) -> crate::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(self.headers.clone())
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .map_err(crate::CaptureError::from)
    }
}

/// Tunables for a capture run.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Root under which every channel gets `{platform}/{channel}/`
    pub output_dir: PathBuf,

    /// Sleep between successful iterations; bounds how often the playlist is polled
    pub poll_interval: Duration,

    /// Sleep after a failed playlist resolution or a failed batch merge
    pub failure_backoff: Duration,

    /// Consecutive playlist failures tolerated before the run is aborted
    pub playlist_max_failures: u32,

    /// Retry budget for a single segment
    pub segment_retry: RetryPolicy,

    /// Attempts for one append before the run is aborted
    pub append_max_attempts: u32,

    /// How often the background task asks for the session id
    pub session_poll_interval: Duration,

    /// How long finalization waits for a late session id
    pub session_grace: Duration,

    /// Container of the finished file
    pub final_format: FinalFormat,

    /// `chrono` format of the fallback (date-based) file name
    pub date_format: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("vods"),
            poll_interval: Duration::from_secs(5),
            failure_backoff: Duration::from_secs(5),
            playlist_max_failures: 10,
            segment_retry: RetryPolicy::default(),
            append_max_attempts: 3,
            session_poll_interval: Duration::from_secs(5),
            session_grace: Duration::from_secs(10),
            final_format: FinalFormat::Ts,
            date_format: "%m-%d-%Y".to_string(),
        }
    }
}
