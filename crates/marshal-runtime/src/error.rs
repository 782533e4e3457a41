use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("state store error: {0}")]
    Store(#[from] marshal_state::StateError),

    #[error("unknown pod: {0}")]
    UnknownPod(String),

    /// The cluster could not act right now; callers count this as a failed attempt.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}
