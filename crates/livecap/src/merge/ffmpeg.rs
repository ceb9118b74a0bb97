use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::StreamMerger;
use crate::{CaptureError, Result};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Keep child processes from opening a console window on Windows.
fn no_window(cmd: &mut Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    let _ = cmd;
}

/// Stream copy through the ffmpeg concat demuxer.
#[derive(Debug, Clone)]
pub struct FfmpegMerger {
    binary_path: PathBuf,
}

impl Default for FfmpegMerger {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegMerger {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    fn common_args() -> Vec<OsString> {
        ["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]
            .into_iter()
            .map(OsString::from)
            .collect()
    }

    pub(crate) fn concat_args(manifest: &Path, output: &Path) -> Vec<OsString> {
        let mut args = Self::common_args();
        args.extend(["-f", "concat", "-safe", "0", "-i"].map(OsString::from));
        args.push(manifest.as_os_str().to_owned());
        args.extend(["-map", "0", "-c", "copy", "-f", "mpegts"].map(OsString::from));
        args.push(output.as_os_str().to_owned());
        args
    }

    pub(crate) fn remux_args(input: &Path, output: &Path) -> Vec<OsString> {
        let mut args = Self::common_args();
        args.push(OsString::from("-i"));
        args.push(input.as_os_str().to_owned());
        args.extend(
            [
                "-map",
                "0",
                "-c",
                "copy",
                "-copyts",
                "-start_at_zero",
                "-bsf:a",
                "aac_adtstoasc",
                "-movflags",
                "+faststart",
                "-f",
                "mp4",
            ]
            .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());
        args
    }

    async fn run(&self, args: Vec<OsString>, operation: &str) -> Result<()> {
        debug!(binary = %self.binary_path.display(), ?args, "Running ffmpeg {operation}");

        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        no_window(&mut cmd);

        let output = cmd.output().await.map_err(|e| {
            CaptureError::merge_failed(format!(
                "failed to spawn {}: {e}",
                self.binary_path.display()
            ))
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        let tail = tail.into_iter().rev().collect::<Vec<_>>().join(" | ");
        warn!(status = %output.status, stderr = %tail, "ffmpeg {operation} failed");
        Err(CaptureError::merge_failed(format!(
            "ffmpeg {operation} exited with {}: {tail}",
            output.status
        )))
    }
}

#[async_trait]
impl StreamMerger for FfmpegMerger {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn merge_streams(&self, manifest: &Path, output: &Path) -> Result<()> {
        self.run(Self::concat_args(manifest, output), "concat").await
    }

    fn supports_remux(&self) -> bool {
        true
    }

    async fn remux(&self, input: &Path, output: &Path) -> Result<()> {
        self.run(Self::remux_args(input, output), "remux").await
    }
}
