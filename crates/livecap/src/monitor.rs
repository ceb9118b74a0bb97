//! Liveness polling per channel and the supervisor that runs all monitors.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureEngine, CaptureOutcome};
use crate::channel::Channel;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often an offline channel is checked.
    pub check_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(6),
        }
    }
}

/// Watches one channel and starts a capture run whenever it is live.
pub struct ChannelMonitor {
    channel: Channel,
    engine: Arc<CaptureEngine>,
    config: MonitorConfig,
}

impl ChannelMonitor {
    pub fn new(channel: Channel, engine: Arc<CaptureEngine>, config: MonitorConfig) -> Self {
        Self {
            channel,
            engine,
            config,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Poll until `cancel` fires. Failed runs are logged and the channel is
    /// checked again on the next tick.
    pub async fn run(self, cancel: CancellationToken) {
        let channel = &self.channel;
        info!(%channel, interval_secs = self.config.check_interval.as_secs(), "Monitoring channel");

        // A run left by an earlier process or an aborted run may still need
        // finishing once the channel is seen offline.
        let mut may_have_pending = true;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.engine.is_live(channel).await {
                Ok(true) => {
                    info!(%channel, "Channel is live, starting capture");
                    match self.engine.capture(channel, &cancel).await {
                        Ok(CaptureOutcome::Finished { path, session_id }) => {
                            info!(%channel, path = %path.display(), session_id = session_id.as_deref(), "Broadcast captured");
                        }
                        Ok(CaptureOutcome::Empty) => debug!(%channel, "Broadcast ended with nothing captured"),
                        Ok(CaptureOutcome::Interrupted) => break,
                        Err(e) => {
                            error!(%channel, error = %e, "Capture run aborted");
                            may_have_pending = true;
                        }
                    }
                }
                Ok(false) => {
                    debug!(%channel, "Channel is offline");
                    if may_have_pending {
                        may_have_pending = false;
                        self.finish_pending().await;
                    }
                }
                Err(e) => warn!(%channel, error = %e, "Liveness check failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }

        info!(%channel, "Stopped monitoring channel");
    }

    async fn finish_pending(&self) {
        let channel = &self.channel;
        match self.engine.finish_pending(channel).await {
            Ok(Some(CaptureOutcome::Finished { path, session_id })) => {
                info!(%channel, path = %path.display(), session_id = session_id.as_deref(), "Earlier broadcast finished");
            }
            Ok(_) => {}
            Err(e) => warn!(%channel, error = %e, "Failed to finish earlier broadcast"),
        }
    }
}

/// Runs one monitor task per channel.
#[derive(Default)]
pub struct Supervisor {
    monitors: Vec<ChannelMonitor>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, monitor: ChannelMonitor) {
        self.monitors.push(monitor);
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Run every monitor until `cancel` fires and all of them have stopped.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        for monitor in self.monitors {
            tasks.spawn(monitor.run(cancel.child_token()));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Channel monitor task failed");
            }
        }
    }
}
