//! Domain error types and the error-code taxonomy surfaced to transports.

use std::fmt;

use super::entity::Status;

/// Stable, transport-neutral classification of every [`QuantopsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AccessDenied,
    IdempotencyConflict,
    InvalidTransition,
    NotFound,
    ExecutorDispatchFailed,
    PersistenceFailed,
    InvalidInput,
    ConfigError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ExecutorDispatchFailed => "EXECUTOR_DISPATCH_FAILED",
            ErrorCode::PersistenceFailed => "PERSISTENCE_FAILED",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ConfigError => "CONFIG_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for quantops.
#[derive(Debug, thiserror::Error)]
pub enum QuantopsError {
    /// Returned identically for foreign and missing ids.
    #[error("entity {id} not found or not accessible")]
    AccessDenied { id: String },

    #[error("entity {id} not found")]
    NotFound { id: String },

    #[error("idempotency key {key:?} already used by owner {owner_id}")]
    IdempotencyConflict { owner_id: String, key: String },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("dispatch {dispatch_id} is not the active dispatch of entity {id}")]
    StaleDispatch { id: String, dispatch_id: String },

    #[error("entity {id} cannot be deleted while {status}")]
    NotDeletable { id: String, status: Status },

    #[error("executor {executor} failed to dispatch: {reason}")]
    ExecutorDispatchFailed { executor: String, reason: String },

    #[error("commit rejected, nothing was written: {reason}")]
    CommitRejected { reason: String },

    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QuantopsError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        QuantopsError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            QuantopsError::AccessDenied { .. } => ErrorCode::AccessDenied,
            QuantopsError::NotFound { .. } => ErrorCode::NotFound,
            QuantopsError::IdempotencyConflict { .. } => ErrorCode::IdempotencyConflict,
            QuantopsError::InvalidTransition { .. }
            | QuantopsError::StaleDispatch { .. }
            | QuantopsError::NotDeletable { .. } => ErrorCode::InvalidTransition,
            QuantopsError::ExecutorDispatchFailed { .. } => ErrorCode::ExecutorDispatchFailed,
            QuantopsError::CommitRejected { .. }
            | QuantopsError::Database { .. }
            | QuantopsError::DatabaseQuery { .. }
            | QuantopsError::Io(_) => ErrorCode::PersistenceFailed,
            QuantopsError::InvalidInput { .. } | QuantopsError::Json(_) => ErrorCode::InvalidInput,
            QuantopsError::ConfigParse { .. }
            | QuantopsError::ConfigMissing { .. }
            | QuantopsError::ConfigInvalid { .. } => ErrorCode::ConfigError,
        }
    }
}

impl From<&QuantopsError> for std::process::ExitCode {
    fn from(err: &QuantopsError) -> Self {
        let code: u8 = match err.code() {
            ErrorCode::PersistenceFailed => 1,
            ErrorCode::ConfigError => 2,
            ErrorCode::InvalidInput => 3,
            ErrorCode::AccessDenied | ErrorCode::NotFound => 4,
            ErrorCode::IdempotencyConflict => 5,
            ErrorCode::InvalidTransition => 6,
            ErrorCode::ExecutorDispatchFailed => 7,
        };
        std::process::ExitCode::from(code)
    }
}
