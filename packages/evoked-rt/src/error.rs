use thiserror::Error;

/// Errors surfaced by the averaging engine
#[derive(Debug, Error)]
pub enum AveragingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel count mismatch: expected {expected} rows, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Sample buffer released during shutdown")]
    BufferReleased,

    #[error("Consumer thread error: {0}")]
    Thread(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AveragingResult<T> = std::result::Result<T, AveragingError>;
