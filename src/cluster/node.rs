//! The cluster handle clients talk to
//!
//! [`SearchCluster`] hosts every simulated node in one process: shard copies
//! are registered with a [`LocalTransport`] under their node id and located
//! through an [`InMemoryRouting`] table. Writes go through the shard's
//! replication group, reads and searches through the routing table, so a
//! node made unreachable behaves like a failed machine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::index::{index_meta_dir, persisted_indices, IndexHandle};
use super::routing::{InMemoryRouting, RoutingTable};
use crate::config::{AckQuorum, ClusterConfig, IndexSettings};
use crate::error::{Result, ShoalError};
use crate::models::{
    current_timestamp_millis, BulkOperation, DocKey, Document, HealthStatus, NodeId,
    SearchRequest, SearchResponse, SeqNo, ShardId, ShardKey, WriteRequest, WriteResponse,
};
use crate::query::QueryCoordinator;
use crate::replication::{Fault, LocalTransport, ShardTransport};
use crate::shard::{ShardState, ShardStats};

/// Deadline for health checks of one copy
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Stats of one shard copy as seen from the cluster
#[derive(Clone, Debug)]
pub struct CopyStats {
    pub shard: ShardKey,
    pub node: NodeId,
    pub primary: bool,
    pub stale: bool,
    /// `None` when the copy did not answer
    pub stats: Option<ShardStats>,
}

impl CopyStats {
    /// Answered, intact, active and in sync
    pub fn is_serving(&self) -> bool {
        !self.stale
            && self
                .stats
                .as_ref()
                .map_or(false, |s| s.intact && s.state == ShardState::Active)
    }
}

/// An in-process search cluster
pub struct SearchCluster {
    config: ClusterConfig,
    transport: Arc<LocalTransport>,
    routing: Arc<InMemoryRouting>,
    coordinator: QueryCoordinator,
    indices: DashMap<String, Arc<IndexHandle>>,
    /// Suffix of generated document keys
    key_counter: AtomicU64,
}

impl SearchCluster {
    /// Open the cluster stored in `config.data_dir`, reopening persisted indices
    pub async fn open(config: ClusterConfig) -> Result<Self> {
        if config.node_count == 0 {
            return Err(ShoalError::InvalidConfig(
                "a cluster needs at least one node".to_string(),
            ));
        }
        std::fs::create_dir_all(&config.data_dir)?;

        let transport = Arc::new(LocalTransport::new());
        let routing = Arc::new(InMemoryRouting::new());
        let coordinator = QueryCoordinator::new(transport.clone(), routing.clone());
        let cluster = Self {
            config,
            transport,
            routing,
            coordinator,
            indices: DashMap::new(),
            key_counter: AtomicU64::new(0),
        };

        for name in persisted_indices(&cluster.config.data_dir)? {
            let index = IndexHandle::open(
                &cluster.config,
                &name,
                cluster.transport.clone(),
                cluster.routing.clone(),
            )
            .await?;
            cluster.indices.insert(name, index);
        }
        info!(
            data_dir = %cluster.config.data_dir.display(),
            nodes = cluster.config.node_count,
            indices = cluster.indices.len(),
            "cluster opened"
        );
        Ok(cluster)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn routing(&self) -> &Arc<InMemoryRouting> {
        &self.routing
    }

    // --- Index lifecycle ---

    pub async fn create_index(&self, name: &str, settings: IndexSettings) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ShoalError::InvalidConfig(format!(
                "invalid index name '{}'",
                name
            )));
        }
        if self.indices.contains_key(name) || index_meta_dir(&self.config, name).exists() {
            return Err(ShoalError::IndexAlreadyExists(name.to_string()));
        }
        let index = IndexHandle::create(
            &self.config,
            name,
            settings,
            self.transport.clone(),
            self.routing.clone(),
        )
        .await?;
        self.indices.insert(name.to_string(), index);
        Ok(())
    }

    /// Close every copy of `name` and remove its files
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        let (_, index) = self
            .indices
            .remove(name)
            .ok_or_else(|| ShoalError::IndexNotFound(name.to_string()))?;
        for shard in index.shards() {
            for node in 1..=self.config.node_count as NodeId {
                if let Some(engine) = self.transport.deregister(node, shard) {
                    let dir = engine.dir().to_path_buf();
                    tokio::task::spawn_blocking(move || {
                        engine.close()?;
                        std::fs::remove_dir_all(dir)?;
                        Ok::<_, ShoalError>(())
                    })
                    .await
                    .map_err(|e| ShoalError::Internal(format!("shard close task failed: {}", e)))??;
                }
            }
        }
        for node in 1..=self.config.node_count as NodeId {
            let dir = self.config.node_dir(node).join(name);
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        self.routing.remove_index(name);
        std::fs::remove_dir_all(index_meta_dir(&self.config, name))?;
        info!(index = name, "index deleted");
        Ok(())
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn index_handle(&self, name: &str) -> Result<Arc<IndexHandle>> {
        self.indices
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ShoalError::IndexNotFound(name.to_string()))
    }

    // --- Writes ---

    /// Index `doc` under `key`, or under a generated key when none is given
    pub async fn index(
        &self,
        index: &str,
        key: Option<DocKey>,
        doc: Document,
    ) -> Result<WriteResponse> {
        let handle = self.index_handle(index)?;
        let key = key.unwrap_or_else(|| self.generate_key());
        let shard = handle.shard_for(&key);
        handle
            .group(shard)?
            .write(WriteRequest::Index { key, doc })
            .await
    }

    /// Parse a JSON object against the index mapping and index it
    pub async fn index_json(
        &self,
        index: &str,
        key: Option<DocKey>,
        value: &serde_json::Value,
    ) -> Result<WriteResponse> {
        let doc = self.index_handle(index)?.mapping().parse_json(value)?;
        self.index(index, key, doc).await
    }

    /// Delete `key`; `NotFound` without a sequence number when it has no live document
    pub async fn delete(&self, index: &str, key: &str) -> Result<WriteResponse> {
        let handle = self.index_handle(index)?;
        let shard = handle.shard_for(key);
        handle
            .group(shard)?
            .write(WriteRequest::Delete {
                key: key.to_string(),
            })
            .await
    }

    /// Apply `operations`; order is kept within a shard, shards proceed concurrently.
    /// Results line up with the input.
    pub async fn bulk(
        &self,
        index: &str,
        operations: Vec<BulkOperation>,
    ) -> Result<Vec<Result<WriteResponse>>> {
        let handle = self.index_handle(index)?;
        let total = operations.len();

        let mut per_shard: BTreeMap<ShardId, Vec<(usize, WriteRequest)>> = BTreeMap::new();
        for (pos, op) in operations.into_iter().enumerate() {
            let request = match op {
                BulkOperation::Index { key, doc } => WriteRequest::Index {
                    key: key.unwrap_or_else(|| self.generate_key()),
                    doc,
                },
                BulkOperation::Delete { key } => WriteRequest::Delete { key },
            };
            per_shard
                .entry(handle.shard_for(request.key()))
                .or_default()
                .push((pos, request));
        }

        let batches = per_shard.into_iter().map(|(shard, requests)| {
            let handle = handle.clone();
            async move {
                let mut results = Vec::with_capacity(requests.len());
                for (pos, request) in requests {
                    let result = match handle.group(shard) {
                        Ok(group) => group.write(request).await,
                        Err(e) => Err(e),
                    };
                    results.push((pos, result));
                }
                results
            }
        });

        let mut slots: Vec<Option<Result<WriteResponse>>> = (0..total).map(|_| None).collect();
        for (pos, result) in join_all(batches).await.into_iter().flatten() {
            slots[pos] = Some(result);
        }
        let results = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(ShoalError::Internal("bulk slot not filled".to_string()))
                })
            })
            .collect::<Vec<_>>();
        let failed = results.iter().filter(|r| r.is_err()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_admission_error()))
            .count();
        if failed > rejected {
            warn!(index, operations = total, failed, rejected, "bulk hit write failures");
        } else {
            debug!(index, operations = total, rejected, "bulk applied");
        }
        Ok(results)
    }

    fn generate_key(&self) -> DocKey {
        let n = self.key_counter.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{:x}", current_timestamp_millis(), n)
    }

    // --- Reads ---

    /// Latest version of `key` from the primary, or an in-sync replica when the
    /// primary cannot answer
    pub async fn get(&self, index: &str, key: &str) -> Result<Option<Document>> {
        let handle = self.index_handle(index)?;
        let shard = ShardKey::new(index, handle.shard_for(key));
        let routing = self.routing.shard(&shard)?;

        let mut last_error = None;
        for node in routing.serving_copies() {
            if !self.routing.is_reachable(node) {
                continue;
            }
            match self.transport.get(node, &shard, key.to_string()).await {
                Ok(doc) => return Ok(doc),
                Err(e) if e.is_retriable() => {
                    debug!(shard = %shard, node, error = %e, "get failed on copy");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| ShoalError::ShardUnavailable {
            shard: shard.shard,
            reason: "no reachable copy".to_string(),
        }))
    }

    pub async fn search(&self, index: &str, request: SearchRequest) -> Result<SearchResponse> {
        let handle = self.index_handle(index)?;
        let response = self
            .coordinator
            .search(handle.shards(), &request, handle.settings().search_timeout())
            .await?;
        if response.partial {
            warn!(
                index,
                failed = ?response.failed_shards.iter().map(|f| f.shard).collect::<Vec<_>>(),
                "search returned partial results"
            );
        }
        Ok(response)
    }

    // --- Admin ---

    /// Make all writes acknowledged so far visible to search on every serving copy
    pub async fn refresh(&self, index: &str) -> Result<()> {
        let handle = self.index_handle(index)?;
        let calls = self
            .serving_copies(&handle)?
            .into_iter()
            .map(|(shard, node)| async move { self.transport.refresh(node, &shard).await });
        join_all(calls).await.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Merge every serving copy down to at most `max_segments` segments.
    /// Returns the number of merges run on the primaries.
    pub async fn force_merge(&self, index: &str, max_segments: usize) -> Result<usize> {
        let handle = self.index_handle(index)?;
        let mut merges = 0;
        for (shard, node) in self.serving_copies(&handle)? {
            let ran = self.transport.force_merge(node, &shard, max_segments).await?;
            if self.routing.shard(&shard)?.primary == node {
                merges += ran;
            }
        }
        Ok(merges)
    }

    /// Green when every copy is reachable, intact and in sync; red when some
    /// shard has no reachable intact copy; yellow otherwise
    pub async fn health(&self, index: &str) -> Result<HealthStatus> {
        let copies = self.copy_stats(index).await?;
        let mut status = HealthStatus::Green;
        let mut by_shard: BTreeMap<ShardId, Vec<&CopyStats>> = BTreeMap::new();
        for copy in &copies {
            by_shard.entry(copy.shard.shard).or_default().push(copy);
        }
        for (shard, copies) in by_shard {
            let serving = copies.iter().filter(|c| c.is_serving()).count();
            if serving == 0 {
                warn!(index, shard, "no intact copy available");
                return Ok(HealthStatus::Red);
            }
            if serving < copies.len() {
                status = HealthStatus::Yellow;
            }
        }
        Ok(status)
    }

    /// Stats of every copy of `index`
    pub async fn copy_stats(&self, index: &str) -> Result<Vec<CopyStats>> {
        let handle = self.index_handle(index)?;
        let mut out = Vec::new();
        for shard in handle.shards() {
            let routing = self.routing.shard(shard)?;
            let nodes = std::iter::once(routing.primary).chain(routing.replicas.iter().copied());
            for node in nodes {
                let stats = if self.routing.is_reachable(node) {
                    tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.transport.stats(node, shard))
                        .await
                        .ok()
                        .and_then(|r| r.ok())
                } else {
                    None
                };
                out.push(CopyStats {
                    shard: shard.clone(),
                    node,
                    primary: node == routing.primary,
                    stale: routing.is_stale(node),
                    stats,
                });
            }
        }
        Ok(out)
    }

    /// Change the acknowledgment quorum of every shard of `index`
    pub fn set_quorum(&self, index: &str, quorum: AckQuorum) -> Result<()> {
        for group in self.index_handle(index)?.groups() {
            group.set_quorum(quorum);
        }
        Ok(())
    }

    /// Promote a replica of `shard` to primary
    pub async fn failover(&self, index: &str, shard: ShardId) -> Result<NodeId> {
        self.index_handle(index)?.group(shard)?.failover().await
    }

    /// Catch a stale replica up from the primary's log
    pub async fn recover_replica(
        &self,
        index: &str,
        shard: ShardId,
        node: NodeId,
    ) -> Result<SeqNo> {
        self.index_handle(index)?
            .group(shard)?
            .recover_replica(node)
            .await
    }

    /// Recover every stale replica on a reachable node; returns how many rejoined
    pub async fn recover_stale_replicas(&self, index: &str) -> Result<usize> {
        let handle = self.index_handle(index)?;
        let mut recovered = 0;
        for group in handle.groups() {
            let routing = self.routing.shard(group.shard())?;
            for &node in &routing.stale {
                if !self.routing.is_reachable(node) {
                    continue;
                }
                match group.recover_replica(node).await {
                    Ok(_) => recovered += 1,
                    Err(e) => {
                        warn!(shard = %group.shard(), node, error = %e, "replica recovery failed")
                    }
                }
            }
        }
        Ok(recovered)
    }

    /// Trim operation logs of every shard; returns entries removed from primaries
    pub async fn trim_log(&self, index: &str) -> Result<usize> {
        let mut removed = 0;
        for group in self.index_handle(index)?.groups() {
            removed += group.trim_log().await?;
        }
        Ok(removed)
    }

    // --- Fault injection ---

    /// Cut `node` off: its calls fail and routing stops using it
    pub fn isolate_node(&self, node: NodeId) {
        info!(node, "isolating node");
        self.transport.inject(node, Fault::Unreachable);
        self.routing.set_reachable(node, false);
    }

    /// Undo `isolate_node` or `inject_fault`
    pub fn heal_node(&self, node: NodeId) {
        info!(node, "healing node");
        self.transport.heal(node);
        self.routing.set_reachable(node, true);
    }

    /// Make `node` misbehave on the transport only; routing still considers it reachable
    pub fn inject_fault(&self, node: NodeId, fault: Fault) {
        self.transport.inject(node, fault);
    }

    /// Flush and close every shard copy
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for node in 1..=self.config.node_count as NodeId {
            for engine in self.transport.engines_on(node) {
                let key = engine.key().clone();
                let closed = tokio::task::spawn_blocking(move || engine.close())
                    .await
                    .map_err(|e| ShoalError::Internal(format!("shard close task failed: {}", e)))
                    .and_then(|r| r);
                if let Err(e) = closed {
                    warn!(shard = %key, node, error = %e, "shard close failed");
                    first_error.get_or_insert(e);
                }
                self.transport.deregister(node, &key);
            }
        }
        self.indices.clear();
        info!("cluster closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Primary and in-sync replicas of every shard, reachable ones only
    fn serving_copies(&self, handle: &IndexHandle) -> Result<Vec<(ShardKey, NodeId)>> {
        let mut copies = Vec::new();
        for shard in handle.shards() {
            for node in self.routing.shard(shard)?.serving_copies() {
                if self.routing.is_reachable(node) {
                    copies.push((shard.clone(), node));
                }
            }
        }
        Ok(copies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::schema::{FieldMapping, IndexMapping};
    use tempfile::TempDir;

    fn settings() -> IndexSettings {
        IndexSettings::default()
            .with_shards(2)
            .with_replicas(1)
            .with_mapping(IndexMapping::new().field("title", FieldMapping::text()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_index_twice_fails() {
        let dir = TempDir::new().unwrap();
        let cluster = SearchCluster::open(ClusterConfig::new(dir.path(), 2)).await.unwrap();
        cluster.create_index("books", settings()).await.unwrap();
        assert!(matches!(
            cluster.create_index("books", settings()).await,
            Err(ShoalError::IndexAlreadyExists(_))
        ));
        assert!(matches!(
            cluster.get("missing", "a").await,
            Err(ShoalError::IndexNotFound(_))
        ));
        cluster.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_too_many_replicas_rejected() {
        let dir = TempDir::new().unwrap();
        let cluster = SearchCluster::open(ClusterConfig::new(dir.path(), 2)).await.unwrap();
        assert!(matches!(
            cluster.create_index("books", settings().with_replicas(2)).await,
            Err(ShoalError::InvalidConfig(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_read_search_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cluster = SearchCluster::open(ClusterConfig::new(dir.path(), 2)).await.unwrap();
        cluster.create_index("books", settings()).await.unwrap();

        let created = cluster
            .index("books", Some("1".into()), Document::new().with_text("title", "rust in action"))
            .await
            .unwrap();
        assert_eq!(created.seq_no, Some(1));
        let generated = cluster
            .index("books", None, Document::new().with_text("title", "programming rust"))
            .await
            .unwrap();
        assert!(!generated.key.is_empty());

        assert!(cluster.get("books", "1").await.unwrap().is_some());
        cluster.refresh("books").await.unwrap();
        let response = cluster
            .search("books", SearchRequest::new(Query::match_text("title", "rust")))
            .await
            .unwrap();
        assert_eq!(response.hits.len(), 2);
        assert!(!response.partial);
        assert_eq!(cluster.health("books").await.unwrap(), HealthStatus::Green);
        cluster.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bulk_keeps_input_order() {
        let dir = TempDir::new().unwrap();
        let cluster = SearchCluster::open(ClusterConfig::new(dir.path(), 2)).await.unwrap();
        cluster.create_index("books", settings()).await.unwrap();

        let results = cluster
            .bulk(
                "books",
                vec![
                    BulkOperation::Index {
                        key: Some("a".into()),
                        doc: Document::new().with_text("title", "one"),
                    },
                    BulkOperation::Delete { key: "a".into() },
                    BulkOperation::Delete { key: "b".into() },
                ],
            )
            .await
            .unwrap();
        let outcomes: Vec<_> = results.into_iter().map(|r| r.unwrap().result).collect();
        assert_eq!(
            outcomes,
            vec![
                crate::models::WriteOutcome::Created,
                crate::models::WriteOutcome::Deleted,
                crate::models::WriteOutcome::NotFound
            ]
        );
        cluster.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_index_removes_files() {
        let dir = TempDir::new().unwrap();
        let cluster = SearchCluster::open(ClusterConfig::new(dir.path(), 2)).await.unwrap();
        cluster.create_index("books", settings()).await.unwrap();
        cluster.delete_index("books").await.unwrap();
        assert!(cluster.index_names().is_empty());
        assert!(!dir.path().join("node1/books").exists());
        cluster.create_index("books", settings()).await.unwrap();
        cluster.close().await.unwrap();
    }
}
