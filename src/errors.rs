use stream_backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Failed to spawn probe for stream {stream_id}: {source}")]
    Spawn {
        stream_id: String,
        source: std::io::Error,
    },
    #[error("Invalid custom command: {0}")]
    InvalidCommand(String),
    #[error("Logger error: {0}")]
    Logger(#[from] log::SetLoggerError),
}
