//! State store errors.
//!
//! Storage failures carry redb's message as a string so that callers above
//! this crate never depend on redb types. `NotFound` and `Conflict` are the
//! two errors the lifecycle services act on.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state store: {0}")]
    Open(String),

    #[error("state store transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    #[error("cannot read record: {0}")]
    Read(String),

    #[error("cannot write record: {0}")]
    Write(String),

    #[error("cannot encode record: {0}")]
    Serialize(String),

    /// A stored row no longer matches its record type.
    #[error("cannot decode record: {0}")]
    Deserialize(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The write would break a uniqueness, reference or status invariant.
    #[error("{0}")]
    Conflict(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_))
    }
}
