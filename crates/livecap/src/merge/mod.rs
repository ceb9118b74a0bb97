//! Lossless joining of segments into batch containers, and of batch
//! containers onto the growing output file.

mod batch;
mod concat;
mod continuity;
mod ffmpeg;
pub mod manifest;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{CaptureError, Result};

pub use batch::BatchMerger;
pub use concat::ConcatMerger;
pub use continuity::ContinuityMerger;
pub use ffmpeg::FfmpegMerger;

/// Stream-copy backend.
#[async_trait]
pub trait StreamMerger: Send + Sync {
    fn name(&self) -> &'static str;

    /// Join every input listed in `manifest` into `output`, in order.
    async fn merge_streams(&self, manifest: &Path, output: &Path) -> Result<()>;

    fn supports_remux(&self) -> bool {
        false
    }

    /// Copy `input` into an MP4 container without re-encoding.
    async fn remux(&self, _input: &Path, _output: &Path) -> Result<()> {
        Err(CaptureError::configuration(format!(
            "the {} merger cannot remux",
            self.name()
        )))
    }
}

/// `{path}.part`, the temporary sibling used while `path` is rewritten.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

pub(crate) async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

/// Remove a directory tree such as a batch directory with its segment files.
pub(crate) async fn remove_dir_if_exists(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove directory"),
    }
}
