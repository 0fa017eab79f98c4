use flowacct_worker::WorkerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowAcctError {
    #[error("Maximum number of channels reached ({max})")]
    ChannelCapacity { max: usize },

    #[error("Unable to allocate shared region of {size} bytes: {reason}")]
    RegionAlloc { size: usize, reason: String },

    #[error("Transport error on channel {channel}: {message}")]
    Transport { channel: String, message: String },

    #[error("Channel not found: {0}")]
    ChannelNotFound(u16),

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid flow input: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowAcctError {
    pub fn transport(channel: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            channel: channel.into(),
            message: message.to_string(),
        }
    }
}

impl From<prometheus::Error> for FlowAcctError {
    fn from(e: prometheus::Error) -> Self {
        Self::MetricsError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowAcctError>;
