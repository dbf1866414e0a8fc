//! Deployment error types.

use std::time::Duration;

use thiserror::Error;
use turing_cluster::ClusterError;

/// Errors returned by the deployment orchestrator.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("no cluster controller registered for environment {0}")]
    UnknownEnvironment(String),

    /// Controllers and configured environments disagree.
    #[error("invalid environment setup: {0}")]
    Environments(String),

    /// Namespace, secret, config map or logger setup failed.
    #[error("failed to {step}: {source}")]
    Dependency {
        step: &'static str,
        #[source]
        source: ClusterError,
    },

    #[error("{component}: {source}")]
    Component {
        component: String,
        #[source]
        source: ClusterError,
    },

    #[error("invalid resource spec: {0}")]
    Build(String),

    /// Every failure of a best-effort teardown.
    #[error("{}", .0.join("; "))]
    Undeploy(Vec<String>),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{component}: task failed: {message}")]
    TaskPanicked { component: String, message: String },
}

impl DeployError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeployError::Timeout { .. })
    }
}

pub type DeployResult<T> = Result<T, DeployError>;
