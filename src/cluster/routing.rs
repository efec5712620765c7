//! Shard routing metadata
//!
//! Which node holds the primary of each shard, which hold replicas, which
//! replicas are stale, and which nodes are reachable at all. Writers, the
//! query coordinator and failover resolve copies only through this table.

use std::collections::BTreeSet;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShoalError};
use crate::models::{NodeId, ShardId, ShardKey};

/// Copies of one shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub primary: NodeId,
    pub replicas: Vec<NodeId>,
    /// Replicas out of the acknowledgment set until they catch up
    #[serde(default)]
    pub stale: BTreeSet<NodeId>,
}

impl ShardRouting {
    pub fn new(primary: NodeId, replicas: Vec<NodeId>) -> Self {
        Self {
            primary,
            replicas,
            stale: BTreeSet::new(),
        }
    }

    pub fn is_stale(&self, node: NodeId) -> bool {
        self.stale.contains(&node)
    }

    pub fn in_sync_replicas(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.replicas.iter().copied().filter(|n| !self.is_stale(*n))
    }

    /// Primary first, then in-sync replicas
    pub fn serving_copies(&self) -> Vec<NodeId> {
        std::iter::once(self.primary)
            .chain(self.in_sync_replicas())
            .collect()
    }

    pub fn copy_count(&self) -> usize {
        1 + self.replicas.len()
    }
}

/// Routing metadata shared by every node of a cluster
pub trait RoutingTable: Send + Sync {
    /// Routing of `shard`; `ShardUnavailable` when it was never assigned
    fn shard(&self, shard: &ShardKey) -> Result<ShardRouting>;

    fn assign(&self, shard: ShardKey, routing: ShardRouting);

    /// Shards of `index`, in shard order
    fn shards_of(&self, index: &str) -> Vec<ShardKey>;

    fn remove_index(&self, index: &str);

    /// Make `node` the primary of `shard`. The former primary becomes a stale replica.
    fn promote(&self, shard: &ShardKey, node: NodeId) -> Result<()>;

    fn set_stale(&self, shard: &ShardKey, node: NodeId, stale: bool);

    fn is_reachable(&self, node: NodeId) -> bool;

    fn set_reachable(&self, node: NodeId, reachable: bool);
}

/// Shard of `key` among `shards`
pub fn route(key: &str, shards: u32) -> ShardId {
    crc32fast::hash(key.as_bytes()) % shards.max(1)
}

/// Routing table kept in memory
#[derive(Default)]
pub struct InMemoryRouting {
    shards: DashMap<ShardKey, ShardRouting>,
    unreachable: DashSet<NodeId>,
}

impl InMemoryRouting {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoutingTable for InMemoryRouting {
    fn shard(&self, shard: &ShardKey) -> Result<ShardRouting> {
        self.shards
            .get(shard)
            .map(|r| r.value().clone())
            .ok_or_else(|| ShoalError::ShardUnavailable {
                shard: shard.shard,
                reason: format!("{} is not assigned", shard),
            })
    }

    fn assign(&self, shard: ShardKey, routing: ShardRouting) {
        self.shards.insert(shard, routing);
    }

    fn shards_of(&self, index: &str) -> Vec<ShardKey> {
        let mut keys: Vec<ShardKey> = self
            .shards
            .iter()
            .filter(|e| e.key().index == index)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn remove_index(&self, index: &str) {
        self.shards.retain(|key, _| key.index != index);
    }

    fn promote(&self, shard: &ShardKey, node: NodeId) -> Result<()> {
        let mut entry = self
            .shards
            .get_mut(shard)
            .ok_or_else(|| ShoalError::ShardUnavailable {
                shard: shard.shard,
                reason: format!("{} is not assigned", shard),
            })?;
        let routing = entry.value_mut();
        if routing.primary == node {
            return Ok(());
        }
        let Some(pos) = routing.replicas.iter().position(|n| *n == node) else {
            return Err(ShoalError::Internal(format!(
                "node {} holds no copy of {}",
                node, shard
            )));
        };
        let former = std::mem::replace(&mut routing.primary, node);
        routing.replicas[pos] = former;
        routing.stale.remove(&node);
        routing.stale.insert(former);
        Ok(())
    }

    fn set_stale(&self, shard: &ShardKey, node: NodeId, stale: bool) {
        if let Some(mut routing) = self.shards.get_mut(shard) {
            if stale {
                routing.stale.insert(node);
            } else {
                routing.stale.remove(&node);
            }
        }
    }

    fn is_reachable(&self, node: NodeId) -> bool {
        !self.unreachable.contains(&node)
    }

    fn set_reachable(&self, node: NodeId, reachable: bool) {
        if reachable {
            self.unreachable.remove(&node);
        } else {
            self.unreachable.insert(node);
        }
    }
}
