use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "livecap=info,livecap_engine=info";

#[derive(Parser, Debug)]
#[command(
    name = "livecap",
    version,
    about = "Record live HLS broadcasts into one file per stream"
)]
pub struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml", env = "LIVECAP_CONFIG")]
    pub config: PathBuf,

    /// Directory for the daily rolling log files
    #[arg(long, default_value = "logs", env = "LIVECAP_LOG_DIR")]
    pub log_dir: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Filter used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "livecap=warn,livecap_engine=warn";
        }
        match self.verbose {
            0 => DEFAULT_LOG_FILTER,
            1 => "livecap=debug,livecap_engine=debug",
            _ => "livecap=trace,livecap_engine=trace,reqwest=debug",
        }
    }
}
