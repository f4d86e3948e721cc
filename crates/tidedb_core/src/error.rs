//! Error types for the TideDB engine.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in TideDB engine operations.
///
/// The taxonomy is transport-independent; the router maps each kind onto
/// an HTTP status. Every variant carries a human-readable reason alongside
/// the machine-readable kind.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed document ID, revision ID, history, or parameter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A write's expected parent does not match the current winner and
    /// conflicts are disallowed.
    #[error("conflict on document {doc_id}")]
    Conflict {
        /// The document whose tree rejected the edit.
        doc_id: String,
    },

    /// A validation hook rejected the edit.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Referenced document, revision, or view does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying storage failure. Always fatal to the current operation
    /// or batch, regardless of all-or-nothing mode.
    #[error("storage error: {0}")]
    Storage(#[from] tidedb_storage::StorageError),

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl EngineError {
    /// Creates a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Creates a conflict error for a document.
    pub fn conflict(doc_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Machine-readable kind, stable across releases.
    ///
    /// These match the CouchDB error tokens peers expect in bulk result
    /// rows and error bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Conflict { .. } => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) | Self::DatabaseClosed => "internal_server_error",
        }
    }

    /// Returns true if a bulk write in best-effort mode may record this
    /// error per-document and keep going.
    #[must_use]
    pub fn is_recoverable_in_bulk(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Forbidden(_))
    }
}
