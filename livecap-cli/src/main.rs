use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod app;
mod cli;
mod config;
mod error;
mod logging;

use cli::Args;
use config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = logging::init_logging(&args.log_dir, args.log_filter())?;
    if let Err(e) = logging::cleanup_old_logs(&args.log_dir, logging::LOG_RETENTION_DAYS).await {
        warn!(error = %e, "Failed to clean up old log files");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting livecap");

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let supervisor = app::build_supervisor(&config)?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping captures"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    supervisor.run(cancel).await;

    info!("livecap stopped");
    Ok(())
}
