//! Live HLS capture engine.
//!
//! Watches live channels, downloads their HLS segments in batches and folds
//! every batch into one growing output file. Interrupted runs resume from the
//! persisted checkpoint instead of starting a new file.

pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod hls;
pub mod merge;
pub mod monitor;
pub mod retry;
pub mod token;

pub use capture::{
    CaptureEngine, CaptureOutcome, CaptureState, CommandUploadSink, HttpSessionSource,
    LoggingUploadSink, NoSessionSource, PendingAppend, PersistedRun, RunStateStore,
    SessionIdSource, UploadSink,
};
pub use channel::{Channel, ChannelPaths, Platform};
pub use config::{CaptureConfig, FinalFormat, HttpClientConfig};
pub use error::{CaptureError, Result};
pub use hls::{
    Checkpoint, HttpPlaylistResolver, HttpSegmentSource, MediaPlaylist, PlaylistResolver,
    PlaylistStatus, Segment, SegmentFetcher, SegmentSource, StaticUrlProvider, WorkingBatch,
    track_new_segments,
};
pub use merge::{BatchMerger, ConcatMerger, ContinuityMerger, FfmpegMerger, StreamMerger};
pub use monitor::{ChannelMonitor, MonitorConfig, Supervisor};
pub use retry::RetryPolicy;
pub use token::{OAuthClientCredentialsRefresher, Token, TokenAuth, TokenManager, TokenRefresher};
