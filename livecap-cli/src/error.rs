use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to read config `{}`: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config `{}`: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("Engine error: {0}")]
    Engine(#[from] livecap_engine::CaptureError),
}

pub type Result<T> = std::result::Result<T, AppError>;
