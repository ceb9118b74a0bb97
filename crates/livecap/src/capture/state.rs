use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::Channel;
use crate::hls::Checkpoint;
use crate::{CaptureError, Result};

/// Sidecar describing an unfinished run, so a restarted process can continue
/// the same output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRun {
    pub channel: Channel,
    pub started_at: DateTime<Utc>,
    pub output_path: PathBuf,
    /// Last segment contained in `output_path`.
    pub checkpoint: Checkpoint,
    #[serde(default)]
    pub session_id: Option<String>,
    pub iteration: u64,
    /// Length of `output_path` when `checkpoint` was recorded.
    #[serde(default)]
    pub output_len: u64,
    /// Append announced before the output was swapped.
    #[serde(default)]
    pub pending: Option<PendingAppend>,
}

/// Written before a batch is appended. If the process dies after the swap
/// but before the state is saved again, the output length no longer matches
/// `output_len` and this checkpoint is the one the output really reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAppend {
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<PersistedRun>> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CaptureError::io_path("reading run state", &self.path, e)),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Write the sidecar atomically through a temp file.
    pub async fn save(&self, run: &PersistedRun) -> Result<()> {
        let json = serde_json::to_string_pretty(run)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CaptureError::io_path("creating state directory", parent, e))?;
        }

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json)
            .await
            .map_err(|e| CaptureError::io_path("writing run state", &temp_path, e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| CaptureError::io_path("replacing run state", &self.path, e))?;

        debug!(path = %self.path.display(), iteration = run.iteration, "Run state persisted");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CaptureError::io_path("removing run state", &self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Platform;

    fn run(dir: &Path) -> PersistedRun {
        PersistedRun {
            channel: Channel::new("alice", Platform::Twitch),
            started_at: Utc::now(),
            output_path: dir.join("10-16-2026.ts"),
            checkpoint: Checkpoint::at("https://cdn/seg42.ts"),
            session_id: Some("4711".into()),
            iteration: 3,
            output_len: 188 * 40,
            pending: Some(PendingAppend {
                checkpoint: Checkpoint::at("https://cdn/seg45.ts"),
            }),
        }
    }

    #[tokio::test]
    async fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path().join(".capture/state.json"));
        assert!(store.load().await.unwrap().is_none());

        let saved = run(dir.path());
        store.save(&saved).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(saved));
        assert!(!store.path().with_extension("tmp").exists());

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn state_without_append_record_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path().join("state.json"));
        let json = serde_json::json!({
            "channel": {"name": "alice", "platform": "kick"},
            "started_at": "2026-10-16T20:00:00Z",
            "output_path": "/v/kick/alice/10-16-2026.ts",
            "checkpoint": "https://cdn/seg1.ts",
            "iteration": 1
        });
        tokio::fs::write(store.path(), json.to_string()).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.output_len, 0);
        assert_eq!(loaded.pending, None);
        assert_eq!(loaded.session_id, None);
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path().join("state.json"));
        tokio::fs::write(store.path(), "{not json").await.unwrap();
        assert!(matches!(
            store.load().await,
            Err(CaptureError::State { .. })
        ));
    }
}
