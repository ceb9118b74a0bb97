use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::finalize::{UploadSink, date_stem, final_stem, finalize_output};
use super::session::{NoSessionSource, SessionIdSource, SessionWatcher};
use super::state::{PendingAppend, PersistedRun, RunStateStore};
use crate::channel::{Channel, ChannelPaths};
use crate::config::CaptureConfig;
use crate::hls::{
    Checkpoint, MediaPlaylist, PlaylistResolver, PlaylistStatus, Segment, SegmentFetcher,
    SegmentSource, WorkingBatch, track_new_segments,
};
use crate::merge::{
    BatchMerger, ContinuityMerger, StreamMerger, part_path, remove_dir_if_exists as remove_dir,
    remove_if_exists as remove_file,
};
use crate::{CaptureError, Result};

/// Observable phase of a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    AwaitingPlaylist,
    FetchingBatch,
    MergingBatch,
    AppendingOutput,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The output was moved to its permanent name.
    Finished {
        path: PathBuf,
        session_id: Option<String>,
    },
    /// The broadcast ended before anything was captured.
    Empty,
    /// Shutdown was requested; the run state is kept for resumption.
    Interrupted,
}

enum Step {
    AwaitingPlaylist,
    FetchingBatch {
        segments: Vec<Segment>,
        end_of_stream: bool,
    },
    MergingBatch {
        batch: WorkingBatch,
        end_of_stream: bool,
    },
    AppendingOutput {
        container: PathBuf,
        /// Checkpoint the output reaches once the container is appended.
        checkpoint: Checkpoint,
        end_of_stream: bool,
    },
    Finalizing,
}

impl Step {
    fn state(&self) -> CaptureState {
        match self {
            Self::AwaitingPlaylist => CaptureState::AwaitingPlaylist,
            Self::FetchingBatch { .. } => CaptureState::FetchingBatch,
            Self::MergingBatch { .. } => CaptureState::MergingBatch,
            Self::AppendingOutput { .. } => CaptureState::AppendingOutput,
            Self::Finalizing => CaptureState::Finalizing,
        }
    }
}

/// In-memory state of one run.
#[derive(Debug)]
struct Run {
    started_at: DateTime<Utc>,
    output: PathBuf,
    checkpoint: Checkpoint,
    /// Length of `output` at `checkpoint`.
    output_len: u64,
    iteration: u64,
    session_id: Option<String>,
    /// Loaded from the sidecar and not yet matched against a live playlist.
    unverified: bool,
}

impl Run {
    fn snapshot(&self, channel: &Channel, session_id: Option<String>) -> PersistedRun {
        PersistedRun {
            channel: channel.clone(),
            started_at: self.started_at,
            output_path: self.output.clone(),
            checkpoint: self.checkpoint.clone(),
            session_id,
            iteration: self.iteration,
            output_len: self.output_len,
            pending: None,
        }
    }
}

/// Drives one channel's broadcast from first playlist to finished file.
pub struct CaptureEngine {
    config: CaptureConfig,
    resolver: Arc<dyn PlaylistResolver>,
    fetcher: SegmentFetcher,
    batch_merger: BatchMerger,
    continuity: ContinuityMerger,
    merger: Arc<dyn StreamMerger>,
    session_source: Arc<dyn SessionIdSource>,
    upload_sink: Option<Arc<dyn UploadSink>>,
}

impl CaptureEngine {
    pub fn new(
        config: CaptureConfig,
        resolver: Arc<dyn PlaylistResolver>,
        source: Arc<dyn SegmentSource>,
        merger: Arc<dyn StreamMerger>,
    ) -> Self {
        Self {
            fetcher: SegmentFetcher::new(source, config.segment_retry.clone()),
            batch_merger: BatchMerger::new(merger.clone()),
            continuity: ContinuityMerger::new(merger.clone()),
            merger,
            resolver,
            session_source: Arc::new(NoSessionSource),
            upload_sink: None,
            config,
        }
    }

    pub fn with_session_source(mut self, source: Arc<dyn SessionIdSource>) -> Self {
        self.session_source = source;
        self
    }

    pub fn with_upload_sink(mut self, sink: Arc<dyn UploadSink>) -> Self {
        self.upload_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub async fn is_live(&self, channel: &Channel) -> Result<bool> {
        self.resolver.is_live(channel).await
    }

    /// Capture `channel` until its stream ends, resuming a persisted run if
    /// one exists.
    #[instrument(name = "capture", skip(self, channel, cancel), fields(channel = %channel))]
    pub async fn capture(
        &self,
        channel: &Channel,
        cancel: &CancellationToken,
    ) -> Result<CaptureOutcome> {
        let paths = ChannelPaths::new(&self.config.output_dir, channel);
        let store = RunStateStore::new(paths.state_file());

        let mut run = self.open_run(channel, &paths, &store).await?;
        let mut watcher = self.watch_session(channel, run.session_id.clone());
        let mut step = Step::AwaitingPlaylist;
        let mut playlist_failures = 0u32;

        loop {
            trace!(state = ?step.state(), iteration = run.iteration, "Capture step");

            step = match step {
                Step::AwaitingPlaylist => {
                    if cancel.is_cancelled() {
                        return Ok(interrupted(&run));
                    }

                    match self.resolver.resolve_playlist(channel).await {
                        Ok(PlaylistStatus::Ended) => {
                            info!("Stream ended");
                            Step::Finalizing
                        }
                        Ok(PlaylistStatus::Live(playlist)) => {
                            playlist_failures = 0;

                            // An empty window cannot tell an old broadcast from a new one.
                            if run.unverified && !playlist.segments.is_empty() {
                                run.unverified = false;
                                if self.is_orphaned(channel, &run, &playlist).await {
                                    warn!(
                                        output = %run.output.display(),
                                        "Persisted run belongs to an earlier broadcast, finalizing it"
                                    );
                                    let orphan_session = run.session_id.clone();
                                    self.finish(channel, &paths, &store, &run, orphan_session)
                                        .await?;
                                    run = self.fresh_run(&paths, &store).await?;
                                    watcher = self.watch_session(channel, None);
                                }
                            }

                            let segments = track_new_segments(&playlist, &run.checkpoint);
                            if segments.is_empty() {
                                match self.settle(playlist.end_of_stream, cancel).await {
                                    Some(next) => next,
                                    None => return Ok(interrupted(&run)),
                                }
                            } else {
                                debug!(
                                    segments = segments.len(),
                                    first = segments[0].sequence_index,
                                    "New segments"
                                );
                                Step::FetchingBatch {
                                    segments,
                                    end_of_stream: playlist.end_of_stream,
                                }
                            }
                        }
                        Err(e) => {
                            playlist_failures += 1;
                            if !e.is_retryable()
                                || playlist_failures > self.config.playlist_max_failures
                            {
                                error!(failures = playlist_failures, error = %e, "Giving up on playlist");
                                return Err(e);
                            }
                            warn!(failures = playlist_failures, error = %e, "Playlist unavailable");
                            if !pause(cancel, self.config.failure_backoff).await {
                                return Ok(interrupted(&run));
                            }
                            Step::AwaitingPlaylist
                        }
                    }
                }

                Step::FetchingBatch {
                    segments,
                    end_of_stream,
                } => {
                    run.iteration += 1;
                    let dir = paths.batch_dir(run.iteration);
                    match self.fetcher.fetch_batch(&segments, &dir).await {
                        Ok(batch) => Step::MergingBatch {
                            batch,
                            end_of_stream,
                        },
                        Err(e) => {
                            warn!(iteration = run.iteration, error = %e, "Batch could not be stored");
                            remove_dir(&dir).await;
                            if !pause(cancel, self.config.failure_backoff).await {
                                return Ok(interrupted(&run));
                            }
                            Step::AwaitingPlaylist
                        }
                    }
                }

                Step::MergingBatch {
                    batch,
                    end_of_stream,
                } => {
                    let container = paths.batch_container(run.iteration);
                    match self.batch_merger.merge_batch(&batch, &container).await {
                        Ok(merged) => {
                            let reached = batch
                                .last_tracked()
                                .map(|last| Checkpoint::at(last.uri.clone()))
                                .unwrap_or_else(|| run.checkpoint.clone());
                            if !batch.gaps.is_empty() {
                                warn!(
                                    iteration = run.iteration,
                                    gaps = batch.gaps.len(),
                                    "Batch merged with missing segments"
                                );
                            }
                            match merged {
                                Some(container) => Step::AppendingOutput {
                                    container,
                                    checkpoint: reached,
                                    end_of_stream,
                                },
                                None => {
                                    run.checkpoint = reached;
                                    warn!(iteration = run.iteration, "No segment of the batch could be fetched");
                                    match self.settle(end_of_stream, cancel).await {
                                        Some(next) => next,
                                        None => return Ok(interrupted(&run)),
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(iteration = run.iteration, error = %e, "Batch merge failed, window will be retried");
                            if !pause(cancel, self.config.failure_backoff).await {
                                return Ok(interrupted(&run));
                            }
                            Step::AwaitingPlaylist
                        }
                    }
                }

                Step::AppendingOutput {
                    container,
                    checkpoint,
                    end_of_stream,
                } => {
                    let session_id = watcher.current().or_else(|| run.session_id.clone());
                    let intent = PersistedRun {
                        pending: Some(PendingAppend {
                            checkpoint: checkpoint.clone(),
                        }),
                        ..run.snapshot(channel, session_id.clone())
                    };
                    if let Err(e) = store.save(&intent).await {
                        remove_file(&container).await;
                        let err = CaptureError::append_failed(
                            run.output.clone(),
                            format!("recording the pending append: {e}"),
                        );
                        error!(error = %err, "Aborting run, output keeps its last good state");
                        return Err(err);
                    }

                    self.append_batch(&run.output, &container, &paths).await?;
                    run.checkpoint = checkpoint;
                    run.output_len = file_len(&run.output).await;

                    if let Err(e) = store.save(&run.snapshot(channel, session_id)).await {
                        warn!(error = %e, "Failed to persist run state, the pending append record still matches the output");
                    }
                    info!(
                        iteration = run.iteration,
                        checkpoint = run.checkpoint.uri().unwrap_or_default(),
                        "Batch appended"
                    );

                    match self.settle(end_of_stream, cancel).await {
                        Some(next) => next,
                        None => return Ok(interrupted(&run)),
                    }
                }

                Step::Finalizing => {
                    let has_output = tokio::fs::try_exists(&run.output).await.unwrap_or(false);
                    let session_id = if has_output {
                        watcher
                            .wait(self.config.session_grace)
                            .await
                            .or_else(|| run.session_id.clone())
                    } else {
                        None
                    };
                    if has_output && session_id.is_none() {
                        let unresolved = CaptureError::SessionIdUnresolved {
                            channel: channel.to_string(),
                        };
                        warn!(error = %unresolved, "Naming capture by date");
                    }
                    return self.finish(channel, &paths, &store, &run, session_id).await;
                }
            };
        }
    }

    fn watch_session(&self, channel: &Channel, initial: Option<String>) -> SessionWatcher {
        SessionWatcher::spawn(
            self.session_source.clone(),
            channel.clone(),
            self.config.session_poll_interval,
            initial,
        )
    }

    /// Sleep until the next poll, or finalize right away after the last batch.
    async fn settle(&self, end_of_stream: bool, cancel: &CancellationToken) -> Option<Step> {
        if end_of_stream {
            return Some(Step::Finalizing);
        }
        pause(cancel, self.config.poll_interval)
            .await
            .then_some(Step::AwaitingPlaylist)
    }

    /// A resumed checkpoint missing from a non-empty playlist means the window
    /// moved on or a new broadcast started. The same session id on both sides
    /// keeps the run; anything else retires it.
    async fn is_orphaned(&self, channel: &Channel, run: &Run, playlist: &MediaPlaylist) -> bool {
        let Some(uri) = run.checkpoint.uri() else {
            return false;
        };
        if playlist.segments.is_empty() || playlist.contains(uri) {
            return false;
        }

        let Some(persisted) = run.session_id.as_deref() else {
            return true;
        };
        match self.session_source.current_session_id(channel).await {
            Ok(Some(current)) if current == persisted => {
                warn!(checkpoint = uri, "Checkpoint rotated out of the playlist, continuing with a gap");
                false
            }
            _ => true,
        }
    }

    async fn append_batch(&self, output: &Path, container: &Path, paths: &ChannelPaths) -> Result<()> {
        let attempts = self.config.append_max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self
                .continuity
                .append(output, container, &paths.append_manifest())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, max = attempts, error = %e, "Append failed");
                    last_error = Some(e);
                }
            }
        }

        remove_file(container).await;
        let err = last_error
            .unwrap_or_else(|| CaptureError::append_failed(output, "no append attempted"));
        error!(output = %output.display(), error = %err, "Aborting run, output keeps its last good state");
        Err(err)
    }

    async fn open_run(&self, channel: &Channel, paths: &ChannelPaths, store: &RunStateStore) -> Result<Run> {
        if let Some(run) = self.persisted_run(channel, store).await? {
            info!(
                output = %run.output.display(),
                checkpoint = run.checkpoint.uri().unwrap_or_default(),
                iteration = run.iteration,
                "Resuming persisted run"
            );
            reset_work_dir(paths, Some(store.path())).await?;
            remove_file(&part_path(&run.output)).await;
            return Ok(run);
        }
        self.fresh_run(paths, store).await
    }

    /// The sidecar's run if it belongs to `channel` and its output still
    /// exists, with the checkpoint matched against the output on disk.
    async fn persisted_run(&self, channel: &Channel, store: &RunStateStore) -> Result<Option<Run>> {
        let persisted = match store.load().await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable run state");
                return Ok(None);
            }
        };

        let len = match tokio::fs::metadata(&persisted.output_path).await {
            Ok(meta) if persisted.channel == *channel => meta.len(),
            _ => {
                warn!(output = %persisted.output_path.display(), "Discarding run state without output");
                return Ok(None);
            }
        };
        let (checkpoint, output_len) = reconcile_output(&persisted, len).await?;

        Ok(Some(Run {
            started_at: persisted.started_at,
            output: persisted.output_path,
            checkpoint,
            output_len,
            iteration: persisted.iteration,
            session_id: persisted.session_id,
            unverified: true,
        }))
    }

    /// Finish a run left behind by an earlier process once the channel is no
    /// longer live. `None` when there is nothing to finish.
    #[instrument(name = "finish_pending", skip(self, channel), fields(channel = %channel))]
    pub async fn finish_pending(&self, channel: &Channel) -> Result<Option<CaptureOutcome>> {
        let paths = ChannelPaths::new(&self.config.output_dir, channel);
        let store = RunStateStore::new(paths.state_file());

        let Some(run) = self.persisted_run(channel, &store).await? else {
            return Ok(None);
        };
        info!(output = %run.output.display(), "Finishing run left by an earlier process");
        remove_file(&part_path(&run.output)).await;

        let session_id = run.session_id.clone();
        self.finish(channel, &paths, &store, &run, session_id)
            .await
            .map(Some)
    }

    async fn fresh_run(&self, paths: &ChannelPaths, store: &RunStateStore) -> Result<Run> {
        store.clear().await?;
        reset_work_dir(paths, None).await?;

        let started_at = Utc::now();
        let output = paths.output_file(&date_stem(started_at, &self.config.date_format));
        if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            warn!(path = %output.display(), "Removing stale output of an unfinished run");
            tokio::fs::remove_file(&output)
                .await
                .map_err(|e| CaptureError::io_path("removing stale output", &output, e))?;
        }
        remove_file(&part_path(&output)).await;

        debug!(output = %output.display(), "Starting fresh run");
        Ok(Run {
            started_at,
            output,
            checkpoint: Checkpoint::empty(),
            output_len: 0,
            iteration: 0,
            session_id: None,
            unverified: false,
        })
    }

    async fn finish(
        &self,
        channel: &Channel,
        paths: &ChannelPaths,
        store: &RunStateStore,
        run: &Run,
        session_id: Option<String>,
    ) -> Result<CaptureOutcome> {
        if !tokio::fs::try_exists(&run.output).await.unwrap_or(false) {
            if let Err(e) = store.clear().await {
                warn!(error = %e, "Failed to clear run state");
            }
            remove_dir(paths.work_dir()).await;
            info!("Stream ended without captured data");
            return Ok(CaptureOutcome::Empty);
        }

        let stem = final_stem(session_id.as_deref(), run.started_at, &self.config.date_format);
        let path = finalize_output(
            paths,
            &run.output,
            &stem,
            self.config.final_format,
            self.merger.as_ref(),
        )
        .await?;

        if let Err(e) = store.clear().await {
            warn!(error = %e, "Failed to clear run state");
        }
        remove_dir(paths.work_dir()).await;
        info!(path = %path.display(), session_id = session_id.as_deref(), "Capture finished");

        if let Some(sink) = &self.upload_sink
            && let Err(e) = sink
                .capture_finished(channel, session_id.as_deref(), &path)
                .await
        {
            warn!(path = %path.display(), error = %e, "Upload hand-off failed");
        }

        Ok(CaptureOutcome::Finished { path, session_id })
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Match the sidecar against an output of `len` bytes. The output is only
/// ever replaced by rename, so it is either at the recorded length or at the
/// end of the pending append.
async fn reconcile_output(persisted: &PersistedRun, len: u64) -> Result<(Checkpoint, u64)> {
    let recorded = persisted.output_len;
    if len == recorded {
        return Ok((persisted.checkpoint.clone(), len));
    }

    if let Some(pending) = &persisted.pending
        && len > recorded
    {
        info!(
            checkpoint = pending.checkpoint.uri().unwrap_or_default(),
            "Last append completed before its state was saved"
        );
        return Ok((pending.checkpoint.clone(), len));
    }

    if recorded > 0 && len > recorded {
        warn!(recorded, len, "Cutting output back to its recorded length");
        let path = &persisted.output_path;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| CaptureError::io_path("opening output", path, e))?;
        file.set_len(recorded)
            .await
            .map_err(|e| CaptureError::io_path("truncating output", path, e))?;
        return Ok((persisted.checkpoint.clone(), recorded));
    }

    warn!(recorded, len, "Output length differs from run state, keeping the output as is");
    Ok((persisted.checkpoint.clone(), len))
}

fn interrupted(run: &Run) -> CaptureOutcome {
    info!(iteration = run.iteration, "Capture interrupted, run state kept");
    CaptureOutcome::Interrupted
}

/// Returns `false` when cancelled before `duration` elapsed.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Empty the work directory, keeping only `keep` if given.
async fn reset_work_dir(paths: &ChannelPaths, keep: Option<&Path>) -> Result<()> {
    let dir = paths.work_dir();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| CaptureError::io_path("creating work directory", dir, e))?;

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CaptureError::io_path("listing work directory", dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CaptureError::io_path("listing work directory", dir, e))?
    {
        let path = entry.path();
        if Some(path.as_path()) == keep {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            remove_dir(&path).await;
        } else {
            remove_file(&path).await;
        }
    }
    Ok(())
}
