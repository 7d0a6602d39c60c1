use thiserror::Error;

/// Errors from repository operations (used by trait definitions in rewind-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Coarse error taxonomy shared by every error type the engine exposes.
///
/// Transports (CLI, RPC, HTTP wrappers) map on this instead of matching each
/// concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A workflow, execution, snapshot, or checkpoint id did not resolve.
    NotFound,
    /// The operation is not valid for the execution's current status.
    InvalidState,
    /// Malformed input.
    Validation,
    /// A step callback failed.
    StepExecution,
    /// Timed out acquiring the per-execution lock.
    ConcurrencyConflict,
    /// The persistence layer failed.
    Storage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Validation => "validation_error",
            ErrorKind::StepExecution => "step_execution_error",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::Storage => "storage_error",
        };
        f.write_str(s)
    }
}
