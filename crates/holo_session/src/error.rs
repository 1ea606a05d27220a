//! Error taxonomy for the session layer.
//!
//! Backend collaborators report failures as `anyhow::Error`. When the source is
//! a [`BackendError`] its [`ErrorCode`] is preserved so callers can tell an
//! aborted commit from a precondition failure.

use std::fmt;

/// Status codes reported by the native backend client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unknown,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    ResourceExhausted,
    Internal,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Cancelled => "CANCELLED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a backend implementation with a status code attached.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: ErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors surfaced by sessions, savepoints and the DML compiler.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to parse SQL: {0}")]
    Parse(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("primary key columns may not be updated: {}", .columns.join(", "))]
    PrimaryKeyUpdate { columns: Vec<String> },

    #[error("savepoints are only allowed in read/write transactions: {reason}")]
    SavepointNotAllowed { reason: &'static str },

    #[error("unknown savepoint: {0}")]
    UnknownSavepoint(String),

    #[error("mutations are not allowed in read-only mode")]
    ReadOnlyMutation,

    #[error("{operation} is only valid in batch read-only mode")]
    NotBatchReadOnly { operation: &'static str },

    #[error("transaction mode cannot change while a {active} transaction is active")]
    TransactionActive { active: &'static str },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{operation} failed ({code}): {source:#}")]
    Backend {
        operation: &'static str,
        code: ErrorCode,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} failed: interrupted while waiting for the transaction worker")]
    Interrupted { operation: &'static str },

    #[error("bulk operation failed after {committed_rows} rows were already committed: {source}")]
    PartialCommit {
        committed_rows: u64,
        #[source]
        source: Box<SessionError>,
    },

    #[error("transaction worker: {0}")]
    Worker(String),
}

impl SessionError {
    /// Wraps a backend failure, keeping the backend status code when present.
    pub fn backend(operation: &'static str, source: anyhow::Error) -> Self {
        let code = backend_error_code(&source);
        Self::Backend {
            operation,
            code,
            source,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Status code that best describes this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) | Self::InvalidParameter(_) => ErrorCode::InvalidArgument,
            Self::Unsupported(_) | Self::PrimaryKeyUpdate { .. } => ErrorCode::InvalidArgument,
            Self::SavepointNotAllowed { .. }
            | Self::ReadOnlyMutation
            | Self::NotBatchReadOnly { .. }
            | Self::TransactionActive { .. } => ErrorCode::FailedPrecondition,
            Self::UnknownSavepoint(_) => ErrorCode::NotFound,
            Self::Backend { code, .. } => *code,
            Self::Interrupted { .. } => ErrorCode::Cancelled,
            Self::PartialCommit { source, .. } => source.code(),
            Self::Worker(_) => ErrorCode::Internal,
        }
    }

    /// Returns true when some rows were committed before the failure.
    pub fn is_partial_commit(&self) -> bool {
        matches!(self, Self::PartialCommit { committed_rows, .. } if *committed_rows > 0)
    }
}

/// Extracts the status code from a backend error chain.
pub fn backend_error_code(err: &anyhow::Error) -> ErrorCode {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BackendError>())
        .map(|backend| backend.code)
        .unwrap_or(ErrorCode::Unknown)
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn backend_code_survives_context_layers() {
        let err = Err::<(), _>(BackendError::new(ErrorCode::Aborted, "txn aborted"))
            .context("commit read/write transaction")
            .unwrap_err();
        let wrapped = SessionError::backend("commit", err);
        assert_eq!(wrapped.code(), ErrorCode::Aborted);
        assert!(wrapped.to_string().contains("ABORTED"));
    }

    #[test]
    fn plain_anyhow_errors_map_to_unknown() {
        let wrapped = SessionError::backend("query", anyhow::anyhow!("socket closed"));
        assert_eq!(wrapped.code(), ErrorCode::Unknown);
    }

    #[test]
    fn primary_key_update_lists_columns() {
        let err = SessionError::PrimaryKeyUpdate {
            columns: vec!["id".to_string(), "region".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "primary key columns may not be updated: id, region"
        );
    }

    #[test]
    fn partial_commit_reports_committed_rows() {
        let err = SessionError::PartialCommit {
            committed_rows: 200,
            source: Box::new(SessionError::backend(
                "commit",
                anyhow::Error::new(BackendError::new(ErrorCode::Unavailable, "node down")),
            )),
        };
        assert!(err.is_partial_commit());
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }
}
