//! Node-to-node calls on shard copies
//!
//! [`ShardTransport`] is the seam between a coordinating node and the shard
//! copies it does not own. [`LocalTransport`] serves every node of an
//! in-process cluster and can make nodes unreachable, hang or slow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{Result, ShoalError};
use crate::models::{
    AppliedWrite, DocKey, Document, NodeId, Operation, SearchRequest, SeqNo, ShardKey,
    WriteRequest,
};
use crate::query::DocAddress;
use crate::shard::{ContextId, ShardEngine, ShardQueryResult, ShardStats};

/// Poll period while a hung node waits to be healed
const HANG_POLL: Duration = Duration::from_millis(5);

/// Calls a node accepts for the shard copies it hosts
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Primary write: sequence, log and apply
    async fn write(
        &self,
        node: NodeId,
        shard: &ShardKey,
        request: WriteRequest,
    ) -> Result<AppliedWrite>;

    /// Apply an operation sequenced by the primary; returns the replica's checkpoint
    async fn replicate(&self, node: NodeId, shard: &ShardKey, op: Operation) -> Result<SeqNo>;

    async fn operations_since(
        &self,
        node: NodeId,
        shard: &ShardKey,
        after: SeqNo,
    ) -> Result<Vec<Operation>>;

    async fn local_checkpoint(&self, node: NodeId, shard: &ShardKey) -> Result<SeqNo>;

    async fn promote(&self, node: NodeId, shard: &ShardKey) -> Result<()>;

    async fn demote(&self, node: NodeId, shard: &ShardKey) -> Result<()>;

    async fn get(&self, node: NodeId, shard: &ShardKey, key: DocKey) -> Result<Option<Document>>;

    async fn refresh(&self, node: NodeId, shard: &ShardKey) -> Result<()>;

    async fn force_merge(
        &self,
        node: NodeId,
        shard: &ShardKey,
        max_segments: usize,
    ) -> Result<usize>;

    async fn trim_log(&self, node: NodeId, shard: &ShardKey, upto: SeqNo) -> Result<usize>;

    async fn stats(&self, node: NodeId, shard: &ShardKey) -> Result<ShardStats>;

    /// Search phase 1
    async fn query(
        &self,
        node: NodeId,
        shard: &ShardKey,
        request: SearchRequest,
    ) -> Result<ShardQueryResult>;

    /// Search phase 2
    async fn fetch(
        &self,
        node: NodeId,
        shard: &ShardKey,
        context: ContextId,
        addresses: Vec<DocAddress>,
    ) -> Result<Vec<Option<Document>>>;

    async fn release(&self, node: NodeId, shard: &ShardKey, context: ContextId) -> Result<bool>;
}

/// Injected misbehavior of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Calls fail at once with `NodeUnreachable`
    Unreachable,
    /// Calls block until the fault is healed
    Hang,
    /// Calls are delayed
    Latency(Duration),
}

/// In-process transport over the engines registered per node
#[derive(Default)]
pub struct LocalTransport {
    engines: DashMap<(NodeId, ShardKey), Arc<ShardEngine>>,
    faults: DashMap<NodeId, Fault>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `engine` on `node`, replacing any copy of the same shard there
    pub fn register(&self, node: NodeId, engine: Arc<ShardEngine>) {
        self.engines.insert((node, engine.key().clone()), engine);
    }

    pub fn deregister(&self, node: NodeId, shard: &ShardKey) -> Option<Arc<ShardEngine>> {
        self.engines
            .remove(&(node, shard.clone()))
            .map(|(_, engine)| engine)
    }

    /// The copy of `shard` hosted on `node`, ignoring faults
    pub fn engine(&self, node: NodeId, shard: &ShardKey) -> Option<Arc<ShardEngine>> {
        self.engines
            .get(&(node, shard.clone()))
            .map(|e| e.value().clone())
    }

    /// Every copy hosted on `node`
    pub fn engines_on(&self, node: NodeId) -> Vec<Arc<ShardEngine>> {
        self.engines
            .iter()
            .filter(|e| e.key().0 == node)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn inject(&self, node: NodeId, fault: Fault) {
        debug!(node, ?fault, "injecting fault");
        self.faults.insert(node, fault);
    }

    pub fn heal(&self, node: NodeId) {
        if self.faults.remove(&node).is_some() {
            debug!(node, "fault healed");
        }
    }

    pub fn fault(&self, node: NodeId) -> Option<Fault> {
        self.faults.get(&node).map(|f| *f)
    }

    async fn check_fault(&self, node: NodeId) -> Result<()> {
        loop {
            match self.fault(node) {
                None => return Ok(()),
                Some(Fault::Unreachable) => return Err(ShoalError::NodeUnreachable(node)),
                Some(Fault::Latency(delay)) => {
                    tokio::time::sleep(delay).await;
                    return Ok(());
                }
                Some(Fault::Hang) => tokio::time::sleep(HANG_POLL).await,
            }
        }
    }

    /// Run `f` on the engine of `shard` at `node` on the blocking pool
    async fn call<T, F>(&self, node: NodeId, shard: &ShardKey, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ShardEngine) -> Result<T> + Send + 'static,
    {
        self.check_fault(node).await?;
        let engine = self.engine(node, shard).ok_or_else(|| ShoalError::ShardUnavailable {
            shard: shard.shard,
            reason: format!("no copy of {} on node {}", shard, node),
        })?;
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| ShoalError::Internal(format!("shard task failed: {}", e)))?
    }
}

#[async_trait]
impl ShardTransport for LocalTransport {
    async fn write(
        &self,
        node: NodeId,
        shard: &ShardKey,
        request: WriteRequest,
    ) -> Result<AppliedWrite> {
        self.call(node, shard, move |engine| match request {
            WriteRequest::Index { key, doc } => engine.index(key, doc),
            WriteRequest::Delete { key } => engine.delete(&key),
        })
        .await
    }

    async fn replicate(&self, node: NodeId, shard: &ShardKey, op: Operation) -> Result<SeqNo> {
        self.call(node, shard, move |engine| engine.apply_replicated(op))
            .await
    }

    async fn operations_since(
        &self,
        node: NodeId,
        shard: &ShardKey,
        after: SeqNo,
    ) -> Result<Vec<Operation>> {
        self.call(node, shard, move |engine| engine.operations_since(after))
            .await
    }

    async fn local_checkpoint(&self, node: NodeId, shard: &ShardKey) -> Result<SeqNo> {
        self.call(node, shard, |engine| Ok(engine.local_checkpoint()))
            .await
    }

    async fn promote(&self, node: NodeId, shard: &ShardKey) -> Result<()> {
        self.call(node, shard, |engine| engine.promote_to_primary())
            .await
    }

    async fn demote(&self, node: NodeId, shard: &ShardKey) -> Result<()> {
        self.call(node, shard, |engine| {
            engine.demote_to_replica();
            Ok(())
        })
        .await
    }

    async fn get(&self, node: NodeId, shard: &ShardKey, key: DocKey) -> Result<Option<Document>> {
        self.call(node, shard, move |engine| engine.get(&key)).await
    }

    async fn refresh(&self, node: NodeId, shard: &ShardKey) -> Result<()> {
        self.call(node, shard, |engine| engine.refresh()).await
    }

    async fn force_merge(
        &self,
        node: NodeId,
        shard: &ShardKey,
        max_segments: usize,
    ) -> Result<usize> {
        self.call(node, shard, move |engine| engine.force_merge(max_segments))
            .await
    }

    async fn trim_log(&self, node: NodeId, shard: &ShardKey, upto: SeqNo) -> Result<usize> {
        self.call(node, shard, move |engine| engine.trim_log(upto))
            .await
    }

    async fn stats(&self, node: NodeId, shard: &ShardKey) -> Result<ShardStats> {
        self.call(node, shard, |engine| Ok(engine.stats())).await
    }

    async fn query(
        &self,
        node: NodeId,
        shard: &ShardKey,
        request: SearchRequest,
    ) -> Result<ShardQueryResult> {
        self.call(node, shard, move |engine| engine.search_local(&request))
            .await
    }

    async fn fetch(
        &self,
        node: NodeId,
        shard: &ShardKey,
        context: ContextId,
        addresses: Vec<DocAddress>,
    ) -> Result<Vec<Option<Document>>> {
        self.call(node, shard, move |engine| engine.fetch(context, &addresses))
            .await
    }

    async fn release(&self, node: NodeId, shard: &ShardKey, context: ContextId) -> Result<bool> {
        self.call(node, shard, move |engine| Ok(engine.release_context(context)))
            .await
    }
}
