//! Shard copies
//!
//! A [`ShardEngine`] owns one copy of one shard on disk: its operation log,
//! segments and manifest, plus the reader snapshot searches run against and
//! a background worker for periodic refresh and merges.

mod engine;
mod snapshot;
mod worker;

pub use engine::{ShardEngine, ShardState, ShardStats, CONTEXT_KEEP_ALIVE, OPERATION_LOG_FILE};
pub use snapshot::{ContextId, SearchContexts, ShardQueryResult, ShardSnapshot};
pub use worker::{ShardWorker, WorkerTask};
