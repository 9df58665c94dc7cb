use crate::types::Sequence;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AthanorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection drops, timeouts and other infrastructure failures.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate subscription names: {}", .0.join(", "))]
    DuplicateSubscriptionNames(Vec<String>),

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Critical failure in shard {shard} after sequence {sequence}: {message}")]
    CriticalFailure {
        shard: String,
        sequence: Sequence,
        message: String,
    },

    #[error("Progress conflict for shard {shard}: expected {expected}, found {actual}")]
    ProgressConflict {
        shard: String,
        expected: Sequence,
        actual: Sequence,
    },

    #[error("Ordering violation for shard {shard}: expected {expected}, found {actual}")]
    OrderingViolation {
        shard: String,
        expected: Sequence,
        actual: Sequence,
    },

    #[error("Projections did not catch up within {timeout:?}; lagging: {}", .lagging.join(", "))]
    NonStaleTimeout {
        timeout: Duration,
        lagging: Vec<String>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// This node stopped owning its shard set while a page was in flight.
    #[error("Shard set ownership lost while applying {0}")]
    OwnershipLost(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AthanorError {
    /// Errors worth retrying without operator involvement.
    ///
    /// Fetch and high-water detection retry these forever with backoff;
    /// apply and commit retry them a bounded number of times.
    pub fn is_transient(&self) -> bool {
        matches!(self, AthanorError::Storage(_) | AthanorError::Io(_))
    }
}

impl From<serde_json::Error> for AthanorError {
    fn from(err: serde_json::Error) -> Self {
        AthanorError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AthanorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AthanorError::Storage("connection reset".into()).is_transient());
        assert!(!AthanorError::Projection("bad payload".into()).is_transient());
        assert!(!AthanorError::Cancelled.is_transient());
    }

    #[test]
    fn test_duplicate_names_message() {
        let err = AthanorError::DuplicateSubscriptionNames(vec![
            "Trips:All".to_string(),
            "Kafka:All".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Duplicate subscription names: Trips:All, Kafka:All"
        );
    }
}
