use thiserror::Error;

use crate::models::{NodeId, SeqNo, ShardId};

/// Main error type for shoal operations
#[derive(Error, Debug)]
pub enum ShoalError {
    #[error("Mapping conflict on field '{field}': bound to {existing}, got {attempted}")]
    MappingConflict {
        field: String,
        existing: String,
        attempted: String,
    },

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Shard {shard} unavailable: {reason}")]
    ShardUnavailable { shard: ShardId, reason: String },

    #[error("Replication timed out for seq {seq_no}: {acked}/{required} copies acknowledged")]
    ReplicationTimeout {
        seq_no: SeqNo,
        acked: usize,
        required: usize,
    },

    #[error("Insufficient active copies: quorum requires {required}, {available} available")]
    InsufficientCopies { required: usize, available: usize },

    #[error("Shard {0} is not the primary copy")]
    NotPrimary(ShardId),

    #[error("Sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: SeqNo, actual: SeqNo },

    #[error("Shard is {state}, operation requires Active")]
    IllegalState { state: String },

    #[error("Corrupt segment {segment}: {reason}")]
    CorruptSegment { segment: String, reason: String },

    #[error("Node {0} unreachable")]
    NodeUnreachable(NodeId),

    #[error("Search context {0} not found")]
    ContextMissing(u64),

    #[error("Operation log no longer holds seq {0}")]
    LogTruncated(SeqNo),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for shoal operations
pub type Result<T> = std::result::Result<T, ShoalError>;

impl ShoalError {
    /// Check if this error indicates a transient failure that could be retried,
    /// possibly on another copy of the shard
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ShoalError::ShardUnavailable { .. }
                | ShoalError::IllegalState { .. }
                | ShoalError::ReplicationTimeout { .. }
                | ShoalError::NodeUnreachable(_)
                | ShoalError::InsufficientCopies { .. }
                | ShoalError::Io(_)
        )
    }

    /// Errors raised before an operation is admitted to the operation log.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            ShoalError::MappingConflict { .. }
                | ShoalError::MalformedDocument(_)
                | ShoalError::InsufficientCopies { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShoalError::MappingConflict {
            field: "price".to_string(),
            existing: "long".to_string(),
            attempted: "text".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Mapping conflict on field 'price': bound to long, got text"
        );

        let err = ShoalError::ReplicationTimeout {
            seq_no: 7,
            acked: 2,
            required: 3,
        };
        assert_eq!(
            err.to_string(),
            "Replication timed out for seq 7: 2/3 copies acknowledged"
        );
    }

    #[test]
    fn test_retriable_errors() {
        assert!(ShoalError::NodeUnreachable(3).is_retriable());
        assert!(ShoalError::ShardUnavailable {
            shard: 0,
            reason: "no primary".to_string()
        }
        .is_retriable());
        assert!(ShoalError::IllegalState {
            state: "Closing".to_string()
        }
        .is_retriable());
        assert!(!ShoalError::MalformedDocument("x".to_string()).is_retriable());
        assert!(!ShoalError::InvalidQuery("range on text".to_string()).is_retriable());
    }

    #[test]
    fn test_admission_errors() {
        assert!(ShoalError::MalformedDocument("bad".to_string()).is_admission_error());
        assert!(!ShoalError::ReplicationTimeout {
            seq_no: 1,
            acked: 1,
            required: 2
        }
        .is_admission_error());
    }
}
