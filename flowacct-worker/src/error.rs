use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Backend error ({backend}): {message}")]
    Backend { backend: String, message: String },

    #[error("Backend '{0}' is not connected")]
    NotConnected(String),

    #[error("Invalid magic number in recovery log {}", .0.display())]
    InvalidMagic(PathBuf),

    #[error("Invalid template in recovery log {}", .0.display())]
    InvalidTemplate(PathBuf),

    #[error("Unable to obtain lock of {}", .0.display())]
    LockFailed(PathBuf),

    #[error("Recovery log {} is truncated", .0.display())]
    Truncated(PathBuf),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn backend(backend: impl Into<String>, message: impl ToString) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
