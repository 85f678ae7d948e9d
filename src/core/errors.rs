use thiserror::Error;

use crate::object::AccessMode;

#[derive(Debug, Error)]
pub enum OptsvaError {
    #[error("invalid access bounds: {0}")]
    InvalidBounds(String),

    #[error("upper bound exceeded: {0}")]
    UpperBoundExceeded(String),

    #[error("access mode violation: {method} method called through a {declared} proxy")]
    AccessModeViolation {
        declared: AccessMode,
        method: AccessMode,
    },

    #[error("transaction forced to roll back: {0}")]
    ForcedRollback(String),

    #[error("transaction retry requested")]
    Retry,

    #[error("transaction gave up after {0} attempts")]
    RetryLimitExceeded(usize),

    #[error("invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("bson serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("task scheduler failed: {0}")]
    SchedulerFailed(String),

    #[error("{0} has been shut down")]
    ServiceStopped(&'static str),
}

impl OptsvaError {
    /// True for the conditions a driving loop answers by rolling back and
    /// running the transaction body again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OptsvaError::Retry | OptsvaError::Transport(_))
    }

    pub fn is_forced_rollback(&self) -> bool {
        matches!(self, OptsvaError::ForcedRollback(_))
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct SnapshotError(pub String);
