//! Lifecycle error types.

use thiserror::Error;
use turing_deploy::DeployError;
use turing_state::{RouterVersionId, StateError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} not found")]
    NotFound(String),

    /// The request conflicts with the current state of a record.
    #[error("{0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// The version was recorded as failed; the router was left as it was.
    #[error("deployment of router version {version_id} failed: {source}")]
    DeployFailed {
        version_id: RouterVersionId,
        #[source]
        source: DeployError,
    },

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    State(StateError),
}

impl From<StateError> for LifecycleError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => LifecycleError::NotFound(what),
            StateError::Conflict(msg) => LifecycleError::Conflict(msg),
            other => LifecycleError::State(other),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Failure reported by a batch job runner.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RunnerError(pub String);

pub type RunnerResult<T> = Result<T, RunnerError>;
