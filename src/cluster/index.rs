//! One index of the in-process cluster
//!
//! An index owns its settings, its mapping registry and analyzer, and one
//! replication group per shard. Settings and mapping live under
//! `<data_dir>/indices/<name>/`; each shard copy lives under
//! `<data_dir>/node<n>/<name>/<shard>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::routing::{route, RoutingTable, ShardRouting};
use crate::config::{ClusterConfig, IndexSettings};
use crate::error::{Result, ShoalError};
use crate::models::{NodeId, SeqNo, ShardId, ShardKey};
use crate::persistence::write_atomic;
use crate::replication::{LocalTransport, ReplicationGroup, ShardTransport};
use crate::schema::MappingRegistry;
use crate::shard::ShardEngine;
use crate::tokenizer::Tokenizer;

pub const SETTINGS_FILE: &str = "settings.json";
pub const MAPPING_FILE: &str = "mapping.json";

/// Directory holding the settings and mapping of `name`
pub fn index_meta_dir(config: &ClusterConfig, name: &str) -> PathBuf {
    config.data_dir.join("indices").join(name)
}

/// Directory of the copy of `shard` hosted on `node`
pub fn shard_copy_dir(config: &ClusterConfig, node: NodeId, shard: &ShardKey) -> PathBuf {
    config
        .node_dir(node)
        .join(&shard.index)
        .join(shard.shard.to_string())
}

/// Nodes holding copies of `shard`, preferred primary first
pub fn placement(shard: ShardId, copies: usize, node_count: usize) -> Vec<NodeId> {
    (0..copies)
        .map(|i| ((shard as usize + i) % node_count) as NodeId + 1)
        .collect()
}

pub struct IndexHandle {
    name: String,
    settings: IndexSettings,
    mapping: Arc<MappingRegistry>,
    tokenizer: Arc<Tokenizer>,
    shards: Vec<ShardKey>,
    groups: Vec<Arc<ReplicationGroup>>,
}

impl IndexHandle {
    /// Persist settings for a new index and open its shard copies
    pub async fn create(
        config: &ClusterConfig,
        name: &str,
        settings: IndexSettings,
        transport: Arc<LocalTransport>,
        routing: Arc<dyn RoutingTable>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        if settings.copies_per_shard() > config.node_count {
            return Err(ShoalError::InvalidConfig(format!(
                "{} copies per shard need at least {} nodes, cluster has {}",
                settings.copies_per_shard(),
                settings.copies_per_shard(),
                config.node_count
            )));
        }
        let meta = index_meta_dir(config, name);
        std::fs::create_dir_all(&meta)?;
        write_atomic(&meta.join(SETTINGS_FILE), &serde_json::to_vec_pretty(&settings)?)?;
        Self::load(config, name, settings, transport, routing).await
    }

    /// Reopen an index whose settings were persisted by `create`
    pub async fn open(
        config: &ClusterConfig,
        name: &str,
        transport: Arc<LocalTransport>,
        routing: Arc<dyn RoutingTable>,
    ) -> Result<Arc<Self>> {
        let settings =
            IndexSettings::from_json_file(&index_meta_dir(config, name).join(SETTINGS_FILE))?;
        Self::load(config, name, settings, transport, routing).await
    }

    /// Open every copy as a replica, promote the one with the highest checkpoint
    /// and bring the others back in sync
    async fn load(
        config: &ClusterConfig,
        name: &str,
        settings: IndexSettings,
        transport: Arc<LocalTransport>,
        routing: Arc<dyn RoutingTable>,
    ) -> Result<Arc<Self>> {
        let mapping = Arc::new(MappingRegistry::open(
            index_meta_dir(config, name).join(MAPPING_FILE),
            settings.mapping.clone(),
        )?);
        let tokenizer = Arc::new(Tokenizer::new(&settings.tokenizer)?);

        let mut shards = Vec::with_capacity(settings.number_of_shards as usize);
        let mut groups = Vec::with_capacity(settings.number_of_shards as usize);
        for shard in 0..settings.number_of_shards {
            let key = ShardKey::new(name, shard);
            let nodes = placement(shard, settings.copies_per_shard(), config.node_count);

            // Intact copies outrank any copy missing a refused segment
            let mut best: Option<(NodeId, bool, SeqNo)> = None;
            for &node in &nodes {
                let engine = open_copy(
                    shard_copy_dir(config, node, &key),
                    key.clone(),
                    &settings,
                    mapping.clone(),
                    tokenizer.clone(),
                )
                .await?;
                let rank = (engine.is_intact(), engine.local_checkpoint());
                if best.map_or(true, |(_, intact, checkpoint)| rank > (intact, checkpoint)) {
                    best = Some((node, rank.0, rank.1));
                }
                transport.register(node, engine);
            }
            let Some((primary, intact, checkpoint)) = best else {
                return Err(ShoalError::Internal(format!("{} has no copies", key)));
            };
            if !intact {
                warn!(shard = %key, primary, "no intact copy, shard will not serve");
            }
            transport.promote(primary, &key).await?;
            let replicas: Vec<NodeId> = nodes.into_iter().filter(|n| *n != primary).collect();
            routing.assign(key.clone(), ShardRouting::new(primary, replicas.clone()));

            let group = Arc::new(ReplicationGroup::new(
                key.clone(),
                transport.clone(),
                routing.clone(),
                settings.replication.clone(),
            ));
            for node in replicas {
                if let Err(e) = group.recover_replica(node).await {
                    warn!(shard = %key, node, error = %e, "replica left stale on open");
                    routing.set_stale(&key, node, true);
                }
            }
            debug!(shard = %key, primary, checkpoint, "shard routed");
            shards.push(key);
            groups.push(group);
        }

        info!(
            index = name,
            shards = settings.number_of_shards,
            replicas = settings.number_of_replicas,
            "index opened"
        );
        Ok(Arc::new(Self {
            name: name.to_string(),
            settings,
            mapping,
            tokenizer,
            shards,
            groups,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn mapping(&self) -> &Arc<MappingRegistry> {
        &self.mapping
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    pub fn shards(&self) -> &[ShardKey] {
        &self.shards
    }

    /// Shard owning `key`
    pub fn shard_for(&self, key: &str) -> ShardId {
        route(key, self.settings.number_of_shards)
    }

    pub fn group(&self, shard: ShardId) -> Result<&Arc<ReplicationGroup>> {
        self.groups
            .get(shard as usize)
            .ok_or_else(|| ShoalError::ShardUnavailable {
                shard,
                reason: format!("index {} has {} shards", self.name, self.groups.len()),
            })
    }

    pub fn groups(&self) -> &[Arc<ReplicationGroup>] {
        &self.groups
    }
}

async fn open_copy(
    dir: PathBuf,
    key: ShardKey,
    settings: &IndexSettings,
    mapping: Arc<MappingRegistry>,
    tokenizer: Arc<Tokenizer>,
) -> Result<Arc<ShardEngine>> {
    let config = settings.shard.clone();
    tokio::task::spawn_blocking(move || {
        ShardEngine::open(key, dir, config, mapping, tokenizer, false)
    })
    .await
        .map_err(|e| ShoalError::Internal(format!("shard open task failed: {}", e)))?
}

/// Names of the indices persisted under `data_dir`
pub fn persisted_indices(data_dir: &Path) -> Result<Vec<String>> {
    let root = data_dir.join("indices");
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.path().join(SETTINGS_FILE).exists() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_spreads_primaries() {
        assert_eq!(placement(0, 3, 3), vec![1, 2, 3]);
        assert_eq!(placement(1, 3, 3), vec![2, 3, 1]);
        assert_eq!(placement(4, 2, 3), vec![2, 3]);
    }

    #[test]
    fn test_copy_dir_layout() {
        let config = ClusterConfig::new("/data", 2);
        assert_eq!(
            shard_copy_dir(&config, 2, &ShardKey::new("books", 1)),
            PathBuf::from("/data/node2/books/1")
        );
    }
}
