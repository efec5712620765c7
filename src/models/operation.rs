use serde::{Deserialize, Serialize};

use super::document::{DocKey, Document, SeqNo};

/// Shard number within an index
pub type ShardId = u32;

/// Identifier of a node hosting shard copies
pub type NodeId = u64;

/// A shard of a named index
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub index: String,
    pub shard: ShardId,
}

impl ShardKey {
    pub fn new(index: impl Into<String>, shard: ShardId) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.index, self.shard)
    }
}

/// What an operation log entry does
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    Index(Document),
    Delete,
}

/// A sequenced mutation, as written to the operation log and shipped to replicas
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub seq_no: SeqNo,
    pub key: DocKey,
    pub kind: OperationKind,
}

impl Operation {
    pub fn index(seq_no: SeqNo, key: impl Into<DocKey>, doc: Document) -> Self {
        Self {
            seq_no,
            key: key.into(),
            kind: OperationKind::Index(doc),
        }
    }

    pub fn delete(seq_no: SeqNo, key: impl Into<DocKey>) -> Self {
        Self {
            seq_no,
            key: key.into(),
            kind: OperationKind::Delete,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OperationKind::Delete)
    }
}

/// A write before the primary assigns it a sequence number
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteRequest {
    Index { key: DocKey, doc: Document },
    Delete { key: DocKey },
}

impl WriteRequest {
    pub fn key(&self) -> &str {
        match self {
            WriteRequest::Index { key, .. } | WriteRequest::Delete { key } => key,
        }
    }
}

/// Outcome of a single write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    Updated,
    Deleted,
    /// Delete of a key with no live document; nothing was logged
    NotFound,
}

/// Result of applying a write on a shard copy
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedWrite {
    /// The logged operation, absent for a no-op delete
    pub operation: Option<Operation>,
    pub outcome: WriteOutcome,
}

/// Client-visible acknowledgement of a write
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub key: DocKey,
    pub shard: ShardId,
    pub seq_no: Option<SeqNo>,
    pub result: WriteOutcome,
}

/// One entry of a bulk request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BulkOperation {
    Index { key: Option<DocKey>, doc: Document },
    Delete { key: DocKey },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_constructors() {
        let op = Operation::index(3, "a", Document::new().with_text("t", "x"));
        assert_eq!(op.seq_no, 3);
        assert!(!op.is_delete());

        let del = Operation::delete(4, "a");
        assert!(del.is_delete());
        assert_eq!(del.key, "a");
    }

    #[test]
    fn test_shard_key_display() {
        assert_eq!(ShardKey::new("books", 2).to_string(), "books[2]");
    }

    #[test]
    fn test_write_request_key() {
        let req = WriteRequest::Delete {
            key: "k1".to_string(),
        };
        assert_eq!(req.key(), "k1");
    }
}
