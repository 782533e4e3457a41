//! Error types for update and job operations.
//!
//! Every error maps onto a gRPC-compatible [`StatusCode`] so an API layer
//! can surface it without inspecting variants.

use thiserror::Error;

pub use marshal_core::StatusCode;
use marshal_runtime::RuntimeError;
use marshal_state::{EntityVersion, StateError};

pub type UpdateResult<T> = Result<T, UpdateError>;

#[derive(Debug, Error)]
pub enum UpdateError {
    /// The caller's entity version is stale. The message text is matched by clients.
    #[error("unexpected entity version: job {job} is at {actual}, request carried {presented}")]
    VersionConflict {
        job: String,
        presented: EntityVersion,
        actual: EntityVersion,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Another writer won a race on the same record.
    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("state store error: {0}")]
    Store(StateError),
}

impl From<StateError> for UpdateError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::VersionMismatch {
                job,
                expected,
                actual,
            } => UpdateError::VersionConflict {
                job,
                presented: expected,
                actual,
            },
            StateError::NotFound(what) => UpdateError::NotFound(what),
            StateError::Conflict(what) => UpdateError::Conflict(what),
            e @ StateError::HostStateMismatch { .. } => UpdateError::InvalidState(e.to_string()),
            other => UpdateError::Store(other),
        }
    }
}

impl UpdateError {
    pub fn code(&self) -> StatusCode {
        match self {
            UpdateError::VersionConflict { .. } | UpdateError::Conflict(_) => StatusCode::Aborted,
            UpdateError::InvalidArgument(_) => StatusCode::InvalidArgument,
            UpdateError::NotFound(_) => StatusCode::NotFound,
            UpdateError::InvalidState(_) => StatusCode::FailedPrecondition,
            UpdateError::Runtime(_) | UpdateError::Store(_) => StatusCode::Internal,
        }
    }

    /// Store and race failures that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpdateError::Store(_) | UpdateError::Conflict(_))
    }
}
