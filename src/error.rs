use axum::http::StatusCode;

use crate::cluster::ClusterError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    NameExists(String),
    #[error("{0}")]
    Conflict(String),
    /// Readiness or specialization deadline exceeded; the message always
    /// starts with "timeout".
    #[error("timeout {0}")]
    Timeout(String),
    #[error("{0}")]
    TooManyRequests(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Transient(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

impl ExecutorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ExecutorError::NotFound(_) => StatusCode::NOT_FOUND,
            ExecutorError::AlreadyExists(_)
            | ExecutorError::NameExists(_)
            | ExecutorError::Conflict(_) => StatusCode::CONFLICT,
            ExecutorError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ExecutorError::Invalid(_) => StatusCode::BAD_REQUEST,
            ExecutorError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ExecutorError::Timeout(_) | ExecutorError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecutorError::NotFound(_))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ExecutorError::NotFound(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ExecutorError::Invalid(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        ExecutorError::Timeout(message.into())
    }
}

impl From<ClusterError> for ExecutorError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(msg) => ExecutorError::NotFound(msg),
            ClusterError::AlreadyExists(msg) => ExecutorError::AlreadyExists(msg),
            ClusterError::Conflict(msg) => ExecutorError::Conflict(msg),
            ClusterError::Invalid(msg) => ExecutorError::Invalid(msg),
            ClusterError::Transient(msg) => ExecutorError::Transient(msg),
        }
    }
}
