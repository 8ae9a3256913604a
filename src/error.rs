//! Error taxonomy.
//!
//! Per-item errors ([`ContentError`] for one document body, [`QueueError`]
//! for one queue row) are recovered locally and never abort the containing
//! run or batch. Only [`SyncError::Configuration`] and
//! [`SyncError::Ingestion`] end a sync run with `fail()`.

use thiserror::Error;

/// Errors surfaced to connector code through the sync context.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid source config or credentials. Not retryable.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// One document body could not be stored. The document is skipped.
    #[error("content storage error: {0}")]
    ContentStorage(#[from] ContentError),
    /// Upstream failure of the connected system (rate limit, network).
    /// Retried by the connector itself.
    #[error("transient provider error: {0}")]
    TransientProvider(String),
    /// The ingestion API could not be reached or rejected the call.
    #[error("ingestion API error: {0}")]
    Ingestion(#[from] IngestError),
    /// Cancellation was observed.
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether this error must end the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::ContentStorage(_))
    }
}

/// Errors returned by the ingestion API, in-process or over HTTP.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("content storage error: {0}")]
    ContentStorage(#[from] ContentError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self {
        IngestError::Internal(e.into())
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        IngestError::Transport(e.to_string())
    }
}

/// Content store failures.
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("content blob not found: {0}")]
    NotFound(String),
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("content is not valid UTF-8: {0}")]
    NotText(String),
    #[error("{0}")]
    Rejected(String),
}

/// Failure applying one queued event.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("failed to apply event {event_id}: {message}")]
    Processing { event_id: String, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Embedding provider failures, split by whether a retry can help.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("transient embedding error: {0}")]
    Transient(String),
    #[error("embedding error: {0}")]
    Permanent(String),
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Transient(_))
    }
}
