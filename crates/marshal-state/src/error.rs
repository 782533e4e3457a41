//! Error types for the Marshal state store.

use thiserror::Error;

use crate::types::{EntityVersion, HostState};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job {job} entity version mismatch: expected {expected}, found {actual}")]
    VersionMismatch {
        job: String,
        expected: EntityVersion,
        actual: EntityVersion,
    },

    #[error("host {host} is {actual}, expected {expected}")]
    HostStateMismatch {
        host: String,
        expected: HostState,
        actual: HostState,
    },

    #[error("write conflict: {0}")]
    Conflict(String),
}

impl StateError {
    /// True for precondition failures a caller can resolve by re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StateError::VersionMismatch { .. }
                | StateError::HostStateMismatch { .. }
                | StateError::Conflict(_)
        )
    }
}
