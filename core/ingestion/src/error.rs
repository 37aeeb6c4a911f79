//! Typed errors for the knowledge engine.
//!
//! Library code returns [`EngineError`]; binaries wrap it in `anyhow`.
//! Contradictions are not errors: they are persisted fact state.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The database file cannot be opened, locked or read. Queries fail closed on this.
    #[error("fact store unavailable: {0}")]
    StoreUnavailable(rusqlite::Error),

    /// The store answered but the statement failed (constraint, bad query, type mismatch).
    #[error("storage error: {0}")]
    Storage(rusqlite::Error),

    /// Deep extraction failed for a chunk (retryable until attempts run out).
    #[error("extraction failed for chunk {chunk_id}: {reason}")]
    ExtractionFailure { chunk_id: String, reason: String },

    /// A bounded retrieval step (rerank, embedding) ran past its deadline.
    #[error("retrieval step timed out after {0:?}")]
    RetrievalTimeout(Duration),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A write would break a store invariant (second SUPERSEDES edge, cycle).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ExtractionFailure { .. }
                | EngineError::RetrievalTimeout(_)
                | EngineError::StoreUnavailable(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        if store_is_down(&err) {
            EngineError::StoreUnavailable(err)
        } else {
            EngineError::Storage(err)
        }
    }
}

fn store_is_down(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;

    match err {
        rusqlite::Error::SqliteFailure(failure, _) => matches!(
            failure.code,
            ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::DiskFull
                | ErrorCode::PermissionDenied
                | ErrorCode::FileLockingProtocolFailed
                | ErrorCode::OutOfMemory
        ),
        rusqlite::Error::InvalidPath(_) => true,
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
