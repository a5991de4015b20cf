// src/error.rs
use thiserror::Error;

/// Error taxonomy of the ingestion pipeline.
///
/// `Transport` and `Parse` are produced inside adapters and logged there; they
/// never reach the scheduler. `Storage` is the only kind a tick sees.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Bad registration input, fixable by the caller.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Connection, timeout or non-2xx upstream response.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A single malformed upstream item.
    #[error("parse failure: {0}")]
    Parse(String),

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    StorageTask(String),

    #[error("source not found: {0}")]
    NotFound(String),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
