//! Primary/replica replication
//!
//! - `ShardTransport`: calls on shard copies hosted by other nodes
//! - `LocalTransport`: in-process transport with fault injection
//! - `ReplicationGroup`: quorum writes, stale tracking, catch-up and failover

mod group;
mod transport;

pub use group::ReplicationGroup;
pub use transport::{Fault, LocalTransport, ShardTransport};
