//! In-process cluster: routing, indices and the client-facing handle

mod index;
mod node;
mod routing;

pub use index::{placement, shard_copy_dir, IndexHandle, MAPPING_FILE, SETTINGS_FILE};
pub use node::{CopyStats, SearchCluster};
pub use routing::{route, InMemoryRouting, RoutingTable, ShardRouting};
