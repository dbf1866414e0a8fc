//! Cluster controller error types.

use thiserror::Error;

/// Errors returned by a cluster controller.
///
/// Transient and permanent failures are not distinguished; callers do not
/// retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} {name} already exists in namespace {namespace}")]
    AlreadyExists {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("{kind} {name} not found in namespace {namespace}")]
    NotFound {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("{kind} {name} did not become ready: {reason}")]
    NotReady {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("cluster api error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
