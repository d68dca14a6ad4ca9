//! Application error types for Themis services.

use thiserror::Error;

/// Main error type shared by the judging pipeline and its collaborators.
///
/// These are *infrastructure* failures. Expected execution outcomes such as a
/// wrong answer or a timeout are never represented as an `AppError`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input validation failed
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Conflicting concurrent update (e.g. a lost compare-and-swap race)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The sandbox could not set up or supervise an execution
    #[error("Sandbox error: {0}")]
    SandboxError(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    TimeoutError(String),

    /// Queue error
    #[error("Queue error: {0}")]
    QueueError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Returns the error code string for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::Conflict(_) => "CONFLICT",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::SandboxError(_) => "SANDBOX_ERROR",
            AppError::TimeoutError(_) => "TIMEOUT_ERROR",
            AppError::QueueError(_) => "QUEUE_ERROR",
            AppError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Missing documents and invalid input will fail the same way on every
    /// attempt, so they are not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NotFound(_) | AppError::ValidationError(_) => false,
            AppError::Conflict(_)
            | AppError::DatabaseError(_)
            | AppError::SandboxError(_)
            | AppError::TimeoutError(_)
            | AppError::QueueError(_)
            | AppError::InternalError(_) => true,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::SandboxError(err.to_string())
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("Resource not found".to_string()),
            _ => AppError::DatabaseError(err.to_string()),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(AppError::DatabaseError("connection reset".into()).is_retryable());
        assert!(AppError::SandboxError("spawn failed".into()).is_retryable());
        assert!(!AppError::NotFound("problem".into()).is_retryable());
        assert!(!AppError::ValidationError("no test cases".into()).is_retryable());
    }

    #[test]
    fn test_io_errors_are_sandbox_errors() {
        let err: AppError = std::io::Error::other("disk full").into();
        assert_eq!(err.error_code(), "SANDBOX_ERROR");
    }
}
