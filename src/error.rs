//! Error type shared by the pipeline components.

use thiserror::Error;

/// Errors raised by the monitoring pipeline.
///
/// Collectors never surface these past their own boundary (see
/// [`crate::collectors::Collection`]); the orchestrator, the engines and the
/// scheduler loops do.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("counter store error: {0}")]
    CounterStore(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid stored record: {0}")]
    InvalidRecord(String),

    /// Some items of a batch failed; the rest were processed.
    #[error("partial failure: {0}")]
    PartialFailure(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
