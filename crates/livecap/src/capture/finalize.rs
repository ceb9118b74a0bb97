//! Permanent naming of finished captures and the upload hand-off.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use tokio::process::Command;
use tracing::{info, warn};

use crate::channel::{Channel, ChannelPaths};
use crate::config::FinalFormat;
use crate::merge::{StreamMerger, part_path};
use crate::{CaptureError, Result};

/// Receives every finished capture.
#[async_trait]
pub trait UploadSink: Send + Sync {
    async fn capture_finished(
        &self,
        channel: &Channel,
        session_id: Option<&str>,
        path: &Path,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingUploadSink;

#[async_trait]
impl UploadSink for LoggingUploadSink {
    async fn capture_finished(
        &self,
        channel: &Channel,
        session_id: Option<&str>,
        path: &Path,
    ) -> Result<()> {
        info!(%channel, session_id, path = %path.display(), "Capture ready for upload");
        Ok(())
    }
}

/// Runs an external command (e.g. `rclone move`) for each finished file.
/// `{channel}`, `{platform}`, `{session_id}` and `{path}` in the arguments are
/// substituted.
#[derive(Debug, Clone)]
pub struct CommandUploadSink {
    program: String,
    args: Vec<String>,
}

impl CommandUploadSink {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub(crate) fn render_args(
        &self,
        channel: &Channel,
        session_id: Option<&str>,
        path: &Path,
    ) -> Vec<String> {
        let path = path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{channel}", &channel.name)
                    .replace("{platform}", channel.platform.as_str())
                    .replace("{session_id}", session_id.unwrap_or(""))
                    .replace("{path}", &path)
            })
            .collect()
    }
}

#[async_trait]
impl UploadSink for CommandUploadSink {
    async fn capture_finished(
        &self,
        channel: &Channel,
        session_id: Option<&str>,
        path: &Path,
    ) -> Result<()> {
        let args = self.render_args(channel, session_id, path);
        info!(%channel, program = %self.program, ?args, "Running upload command");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CaptureError::UploadFailed {
                reason: format!("failed to spawn {}: {e}", self.program),
            })?;

        if !output.status.success() {
            return Err(CaptureError::UploadFailed {
                reason: format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Name of the in-progress output, e.g. `10-16-2026`.
pub(crate) fn date_stem(started_at: DateTime<Utc>, date_format: &str) -> String {
    started_at.with_timezone(&Local).format(date_format).to_string()
}

/// Stem of the finished file: the session id, or the start date and time
/// when the session is unknown. Must never equal the in-progress name, which
/// the next run of the same day reuses.
pub(crate) fn final_stem(
    session_id: Option<&str>,
    started_at: DateTime<Utc>,
    date_format: &str,
) -> String {
    match session_id {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => format!(
            "{}_{}",
            date_stem(started_at, date_format),
            started_at.with_timezone(&Local).format("%H%M%S")
        ),
    }
}

/// First of `{stem}.{ext}`, `{stem}-1.{ext}`, ... that does not exist yet.
async fn unused_path(paths: &ChannelPaths, stem: &str, extension: &str) -> PathBuf {
    let mut candidate = paths.final_file(stem, extension);
    let mut n = 1;
    while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate = paths.final_file(&format!("{stem}-{n}"), extension);
        n += 1;
    }
    candidate
}

/// Move the assembled `output` to its permanent name, remuxing to MP4 first
/// when asked to and supported.
pub(crate) async fn finalize_output(
    paths: &ChannelPaths,
    output: &Path,
    stem: &str,
    format: FinalFormat,
    merger: &dyn StreamMerger,
) -> Result<PathBuf> {
    if format == FinalFormat::Mp4 {
        if merger.supports_remux() {
            let target = unused_path(paths, stem, FinalFormat::Mp4.extension()).await;
            let part = part_path(&target);
            match merger.remux(output, &part).await {
                Ok(()) => {
                    tokio::fs::rename(&part, &target)
                        .await
                        .map_err(|e| CaptureError::io_path("renaming remuxed output", &target, e))?;
                    if let Err(e) = tokio::fs::remove_file(output).await {
                        warn!(path = %output.display(), error = %e, "Failed to remove remuxed source");
                    }
                    return Ok(target);
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    warn!(error = %e, "MP4 remux failed, keeping MPEG-TS output");
                }
            }
        } else {
            warn!(merger = merger.name(), "Merger cannot remux, keeping MPEG-TS output");
        }
    }

    let target = unused_path(paths, stem, FinalFormat::Ts.extension()).await;
    tokio::fs::rename(output, &target)
        .await
        .map_err(|e| CaptureError::io_path("renaming finished output", &target, e))?;
    Ok(target)
}
