//! Error types for the transfer engine.

use thiserror::Error;

/// Errors from the source scroller (search and count queries).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("source returned an error response: {0}")]
    ResponseError(String),

    #[error("query timed out")]
    TimedOut,

    #[error("shard failure: {successful}/{total} shards succeeded ({failed} failed)")]
    ShardFailure {
        total: u64,
        successful: u64,
        failed: u64,
    },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid scroller configuration: {0}")]
    Config(String),
}

impl SourceError {
    /// Transient failures are retried forever by the scroller; this
    /// distinguishes them from configuration errors that should propagate.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::Config(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::TimedOut
        } else {
            SourceError::Transport(err)
        }
    }
}

/// Errors from the sink client.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("sink rejected the batch: status {status}, body: {body_preview}")]
    Rejected { status: u16, body_preview: String },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("push cancelled by stop signal")]
    Cancelled,
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::Transport(err)
    }
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("could not connect to the checkpoint store: {0}")]
    Connect(String),

    #[error("checkpoint load failed: {0}")]
    Load(String),

    #[error("checkpoint save failed: {0}")]
    Save(String),

    #[error("checkpoint cleanup failed: {0}")]
    Cleanup(String),
}

impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        CheckpointError::Save(err.to_string())
    }
}

/// Top-level error surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("drain phase exceeded the configured execute timeout")]
    DrainTimeout,
}
