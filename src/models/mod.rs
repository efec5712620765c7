pub mod document;
pub mod operation;
pub mod search;

pub use document::{current_timestamp_millis, DocKey, Document, FieldValue, GeoPoint, SeqNo};
pub use operation::{
    AppliedWrite, BulkOperation, NodeId, Operation, OperationKind, ShardId, ShardKey, WriteOutcome,
    WriteRequest, WriteResponse,
};
pub use search::{
    HealthStatus, SearchHit, SearchRequest, SearchResponse, ShardFailure, SortOrder, SortSpec,
    SortValue,
};
