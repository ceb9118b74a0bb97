use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::{StreamMerger, manifest, remove_dir_if_exists, remove_if_exists};
use crate::hls::WorkingBatch;
use crate::{CaptureError, Result};

/// Turns the segment files of one iteration into a single container.
pub struct BatchMerger {
    merger: Arc<dyn StreamMerger>,
}

impl BatchMerger {
    pub fn new(merger: Arc<dyn StreamMerger>) -> Self {
        Self { merger }
    }

    /// Merge `batch` into `container`.
    ///
    /// Returns `None` for a batch without fetched segments. The batch directory
    /// is removed afterwards whether the merge succeeded or not.
    pub async fn merge_batch(&self, batch: &WorkingBatch, container: &Path) -> Result<Option<PathBuf>> {
        if batch.is_empty() {
            remove_dir_if_exists(&batch.dir).await;
            return Ok(None);
        }

        let manifest_path = batch.dir.join("manifest.txt");
        manifest::write_manifest(&manifest_path, &batch.files()).await?;

        let merged = self.merger.merge_streams(&manifest_path, container).await;
        remove_dir_if_exists(&batch.dir).await;

        match merged {
            Ok(()) => {
                debug!(
                    container = %container.display(),
                    segments = batch.fetched.len(),
                    merger = self.merger.name(),
                    "Batch merged"
                );
                Ok(Some(container.to_path_buf()))
            }
            Err(e) => {
                remove_if_exists(container).await;
                Err(match e {
                    e @ CaptureError::MergeFailed { .. } => e,
                    other => CaptureError::merge_failed(other.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::{FetchedSegment, Segment};
    use crate::merge::ConcatMerger;
    use async_trait::async_trait;

    struct FailingMerger;

    #[async_trait]
    impl StreamMerger for FailingMerger {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn merge_streams(&self, _manifest: &Path, output: &Path) -> Result<()> {
            tokio::fs::write(output, b"partial").await.unwrap();
            Err(CaptureError::merge_failed("exit status 1"))
        }
    }

    async fn batch_with(dir: &Path, parts: &[&[u8]]) -> WorkingBatch {
        tokio::fs::create_dir_all(dir).await.unwrap();
        let mut fetched = Vec::new();
        for (i, bytes) in parts.iter().enumerate() {
            let path = dir.join(format!("{i:05}.ts"));
            tokio::fs::write(&path, bytes).await.unwrap();
            fetched.push(FetchedSegment {
                segment: Segment::new(format!("s{i}"), i as u64),
                path,
            });
        }
        WorkingBatch {
            dir: dir.to_path_buf(),
            tracked: fetched.iter().map(|f| f.segment.clone()).collect(),
            fetched,
            gaps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn merges_segments_in_order_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let batch = batch_with(&tmp.path().join("batch-000001"), &[b"a", b"b", b"c"]).await;
        let container = tmp.path().join("batch-000001.ts");

        let merger = BatchMerger::new(Arc::new(ConcatMerger));
        let out = merger.merge_batch(&batch, &container).await.unwrap();

        assert_eq!(out.as_deref(), Some(container.as_path()));
        assert_eq!(tokio::fs::read(&container).await.unwrap(), b"abc");
        assert!(!batch.dir.exists());
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let batch = batch_with(&tmp.path().join("batch-000002"), &[]).await;
        let container = tmp.path().join("batch-000002.ts");

        let merger = BatchMerger::new(Arc::new(ConcatMerger));
        assert!(merger.merge_batch(&batch, &container).await.unwrap().is_none());
        assert!(!container.exists());
        assert!(!batch.dir.join("manifest.txt").exists());
    }

    #[tokio::test]
    async fn failed_merge_discards_batch_and_partial_container() {
        let tmp = tempfile::tempdir().unwrap();
        let batch = batch_with(&tmp.path().join("batch-000003"), &[b"a"]).await;
        let container = tmp.path().join("batch-000003.ts");

        let merger = BatchMerger::new(Arc::new(FailingMerger));
        let err = merger.merge_batch(&batch, &container).await.unwrap_err();

        assert!(matches!(err, CaptureError::MergeFailed { .. }));
        assert!(!container.exists());
        assert!(!batch.dir.exists());
    }
}
