//! Persistence primitives: the checksummed operation log and atomic file replacement.

mod atomic;
mod oplog;

pub use atomic::{sync_dir, write_atomic, write_synced};
pub use oplog::{AppendFailure, OperationLog};
