//! Capture loop: playlist -> batch -> output file, until the stream ends.

mod engine;
mod finalize;
mod session;
mod state;

pub use engine::{CaptureEngine, CaptureOutcome, CaptureState};
pub use finalize::{CommandUploadSink, LoggingUploadSink, UploadSink};
pub use session::{HttpSessionSource, NoSessionSource, SessionIdSource, SessionWatcher};
pub use state::{PendingAppend, PersistedRun, RunStateStore};
