use std::path::Path;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{StreamMerger, manifest};
use crate::{CaptureError, Result};

/// Byte-level concatenation. MPEG-TS packets are self-delimiting, so joining
/// the files back to back is a valid stream copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatMerger;

#[async_trait]
impl StreamMerger for ConcatMerger {
    fn name(&self) -> &'static str {
        "concat"
    }

    async fn merge_streams(&self, manifest_path: &Path, output: &Path) -> Result<()> {
        let inputs = manifest::read_manifest(manifest_path).await?;
        if inputs.is_empty() {
            return Err(CaptureError::merge_failed(format!(
                "manifest {} lists no inputs",
                manifest_path.display()
            )));
        }

        let file = File::create(output)
            .await
            .map_err(|e| CaptureError::io_path("creating merge output", output, e))?;
        let mut writer = BufWriter::new(file);

        for input in &inputs {
            let mut reader = File::open(input)
                .await
                .map_err(|e| CaptureError::merge_failed(format!("opening {}: {e}", input.display())))?;
            tokio::io::copy(&mut reader, &mut writer)
                .await
                .map_err(|e| CaptureError::io_path("copying merge input", input, e))?;
        }

        writer
            .flush()
            .await
            .map_err(|e| CaptureError::io_path("flushing merge output", output, e))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| CaptureError::io_path("syncing merge output", output, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn concatenates_in_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ts");
        let b = dir.path().join("b.ts");
        tokio::fs::write(&a, b"first-").await.unwrap();
        tokio::fs::write(&b, b"second").await.unwrap();
        let list = dir.path().join("manifest.txt");
        manifest::write_manifest(&list, &[b.clone(), a.clone()]).await.unwrap();

        let out = dir.path().join("out.ts");
        ConcatMerger.merge_streams(&list, &out).await.unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"secondfirst-");
    }

    #[tokio::test]
    async fn missing_input_fails_the_merge() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("manifest.txt");
        manifest::write_manifest(&list, &[PathBuf::from("/does/not/exist.ts")])
            .await
            .unwrap();
        let err = ConcatMerger
            .merge_streams(&list, &dir.path().join("out.ts"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::MergeFailed { .. }));
    }

    #[tokio::test]
    async fn remux_is_not_supported() {
        assert!(!ConcatMerger.supports_remux());
        assert!(
            ConcatMerger
                .remux(Path::new("a.ts"), Path::new("a.mp4"))
                .await
                .is_err()
        );
    }
}
