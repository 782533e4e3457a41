//! Error types for host maintenance.

use thiserror::Error;

use marshal_core::StatusCode;
use marshal_runtime::RuntimeError;
use marshal_state::StateError;

pub type DrainResult<T> = Result<T, DrainError>;

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A host is not in the state the request requires.
    #[error("invalid host state: {0}")]
    InvalidState(String),

    #[error("task operator error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("store error: {0}")]
    Store(StateError),
}

impl From<StateError> for DrainError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => DrainError::NotFound(what),
            e @ StateError::HostStateMismatch { .. } => DrainError::InvalidState(e.to_string()),
            other => DrainError::Store(other),
        }
    }
}

impl DrainError {
    pub fn code(&self) -> StatusCode {
        match self {
            DrainError::InvalidArgument(_) => StatusCode::InvalidArgument,
            DrainError::NotFound(_) => StatusCode::NotFound,
            DrainError::InvalidState(_) => StatusCode::FailedPrecondition,
            DrainError::Runtime(_) | DrainError::Store(_) => StatusCode::Internal,
        }
    }
}
