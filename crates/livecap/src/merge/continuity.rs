use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::{StreamMerger, manifest, part_path, remove_if_exists};
use crate::{CaptureError, Result};

/// Appends batch containers onto the output file.
///
/// The output path only ever holds a complete file: the joined result is
/// written to `{output}.part` and renamed over the output on success.
pub struct ContinuityMerger {
    merger: Arc<dyn StreamMerger>,
}

impl ContinuityMerger {
    pub fn new(merger: Arc<dyn StreamMerger>) -> Self {
        Self { merger }
    }

    /// Append `container` to `output`, using `manifest_path` for the join list.
    ///
    /// On failure the output is untouched, the temporary file is gone and the
    /// container is kept so the append can be retried.
    #[instrument(skip_all, fields(output = %output.display()))]
    pub async fn append(&self, output: &Path, container: &Path, manifest_path: &Path) -> Result<()> {
        let container_len = tokio::fs::metadata(container)
            .await
            .map_err(|e| CaptureError::append_failed(container, format!("batch container unreadable: {e}")))?
            .len();
        if container_len == 0 {
            remove_if_exists(container).await;
            return Ok(());
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            tokio::fs::rename(container, output)
                .await
                .map_err(|e| CaptureError::append_failed(output, format!("moving first batch into place: {e}")))?;
            debug!(bytes = container_len, "Output started from first batch");
            return Ok(());
        }

        let part = part_path(output);
        manifest::write_manifest(manifest_path, &[output.to_path_buf(), container.to_path_buf()])
            .await
            .map_err(|e| CaptureError::append_failed(output, e.to_string()))?;

        if let Err(e) = self.merger.merge_streams(manifest_path, &part).await {
            remove_if_exists(&part).await;
            return Err(CaptureError::append_failed(output, e.to_string()));
        }

        if let Err(e) = tokio::fs::rename(&part, output).await {
            remove_if_exists(&part).await;
            return Err(CaptureError::append_failed(output, format!("swapping in merged file: {e}")));
        }

        remove_if_exists(container).await;
        remove_if_exists(manifest_path).await;
        debug!(bytes = container_len, "Batch appended");
        Ok(())
    }
}
