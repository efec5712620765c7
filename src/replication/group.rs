//! Primary-side replication of one shard
//!
//! The primary sequences every write, then forwards the operation to each
//! in-sync replica through an ordered link: one tokio task per replica
//! draining an unbounded channel, so operations reach a replica in sequence
//! order while different replicas proceed in parallel. A write is
//! acknowledged once the quorum of copies, the primary included, has it.
//!
//! A replica that fails or misses the acknowledgment deadline is marked
//! stale in the routing table. It keeps its place in the replica set but
//! receives no new operations until [`ReplicationGroup::recover_replica`]
//! replays the primary's log into it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::transport::ShardTransport;
use crate::cluster::RoutingTable;
use crate::config::{AckQuorum, ReplicationConfig};
use crate::error::{Result, ShoalError};
use crate::models::{NodeId, Operation, SeqNo, ShardKey, WriteRequest, WriteResponse};

/// Extra wait past the ack deadline for a link to report its outcome
const ACK_GRACE: Duration = Duration::from_millis(50);

struct Forward {
    op: Operation,
    deadline: Instant,
    reply: oneshot::Sender<Result<SeqNo>>,
}

struct ReplicaLink {
    tx: mpsc::UnboundedSender<Forward>,
    /// Highest checkpoint the replica reported
    acked: Arc<AtomicU64>,
}

/// Write replication for one shard, driven from its primary
pub struct ReplicationGroup {
    shard: ShardKey,
    transport: Arc<dyn ShardTransport>,
    routing: Arc<dyn RoutingTable>,
    config: RwLock<ReplicationConfig>,
    /// Held while a write is sequenced and handed to the links, and while a
    /// replica finishes catching up
    sequencer: tokio::sync::Mutex<()>,
    links: DashMap<NodeId, ReplicaLink>,
}

impl ReplicationGroup {
    pub fn new(
        shard: ShardKey,
        transport: Arc<dyn ShardTransport>,
        routing: Arc<dyn RoutingTable>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            shard,
            transport,
            routing,
            config: RwLock::new(config),
            sequencer: tokio::sync::Mutex::new(()),
            links: DashMap::new(),
        }
    }

    pub fn shard(&self) -> &ShardKey {
        &self.shard
    }

    pub fn quorum(&self) -> AckQuorum {
        self.config.read().quorum
    }

    pub fn set_quorum(&self, quorum: AckQuorum) {
        self.config.write().quorum = quorum;
    }

    /// Last checkpoint `node` acknowledged through its link
    pub fn acked_checkpoint(&self, node: NodeId) -> SeqNo {
        self.links
            .get(&node)
            .map_or(0, |l| l.acked.load(Ordering::Acquire))
    }

    /// Sequence `request` on the primary and replicate it to the quorum
    pub async fn write(&self, request: WriteRequest) -> Result<WriteResponse> {
        let key = request.key().to_string();
        let (quorum, ack_timeout) = {
            let config = self.config.read();
            (config.quorum, config.ack_timeout())
        };

        let (op, outcome, required, mut pending, deadline) = {
            let _turn = self.sequencer.lock().await;
            let routing = self.routing.shard(&self.shard)?;
            if !self.routing.is_reachable(routing.primary) {
                return Err(self.primary_unavailable(routing.primary));
            }
            let in_sync: Vec<NodeId> = routing.in_sync_replicas().collect();
            let ack_set = 1 + in_sync.len();
            let required = quorum.required(routing.copy_count(), ack_set);
            if ack_set < required {
                return Err(ShoalError::InsufficientCopies {
                    required,
                    available: ack_set,
                });
            }

            let applied = self
                .transport
                .write(routing.primary, &self.shard, request)
                .await
                .map_err(|e| match e {
                    ShoalError::NodeUnreachable(node) => self.primary_unavailable(node),
                    other => other,
                })?;
            let Some(op) = applied.operation else {
                return Ok(WriteResponse {
                    key,
                    shard: self.shard.shard,
                    seq_no: None,
                    result: applied.outcome,
                });
            };

            let deadline = Instant::now() + ack_timeout;
            let pending: FuturesUnordered<_> = in_sync
                .into_iter()
                .filter_map(|node| self.forward(node, op.clone(), deadline))
                .collect();
            (op, applied.outcome, required, pending, deadline)
        };

        let mut acked = 1;
        while acked < required {
            match tokio::time::timeout_at(deadline + ACK_GRACE, pending.next()).await {
                Ok(Some(Ok(Ok(_)))) => acked += 1,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if acked < required {
            warn!(
                shard = %self.shard,
                seq_no = op.seq_no,
                acked,
                required,
                "write missed its quorum"
            );
            return Err(ShoalError::ReplicationTimeout {
                seq_no: op.seq_no,
                acked,
                required,
            });
        }

        Ok(WriteResponse {
            key,
            shard: self.shard.shard,
            seq_no: Some(op.seq_no),
            result: outcome,
        })
    }

    fn not_intact(&self, node: NodeId) -> ShoalError {
        ShoalError::ShardUnavailable {
            shard: self.shard.shard,
            reason: format!("copy on node {} refused a corrupt segment", node),
        }
    }

    fn primary_unavailable(&self, node: NodeId) -> ShoalError {
        ShoalError::ShardUnavailable {
            shard: self.shard.shard,
            reason: format!("primary on node {} is unreachable", node),
        }
    }

    /// Queue `op` on the link of `node`, starting the link if needed
    fn forward(
        &self,
        node: NodeId,
        op: Operation,
        deadline: Instant,
    ) -> Option<oneshot::Receiver<Result<SeqNo>>> {
        let (reply, rx) = oneshot::channel();
        let mut forward = Forward { op, deadline, reply };
        for _ in 0..2 {
            let tx = self
                .links
                .entry(node)
                .or_insert_with(|| self.spawn_link(node, 0))
                .tx
                .clone();
            match tx.send(forward) {
                Ok(()) => return Some(rx),
                Err(mpsc::error::SendError(returned)) => {
                    // The link task is gone; start a fresh one
                    forward = returned;
                    self.links.remove(&node);
                }
            }
        }
        None
    }

    fn spawn_link(&self, node: NodeId, acked: SeqNo) -> ReplicaLink {
        let (tx, rx) = mpsc::unbounded_channel();
        let acked = Arc::new(AtomicU64::new(acked));
        tokio::spawn(run_link(
            node,
            self.shard.clone(),
            self.transport.clone(),
            self.routing.clone(),
            acked.clone(),
            rx,
        ));
        ReplicaLink { tx, acked }
    }

    /// Replay the primary's log into `node` and return it to the acknowledgment set
    pub async fn recover_replica(&self, node: NodeId) -> Result<SeqNo> {
        let routing = self.routing.shard(&self.shard)?;
        if routing.primary == node || !routing.replicas.contains(&node) {
            return Err(ShoalError::Internal(format!(
                "node {} is not a replica of {}",
                node, self.shard
            )));
        }
        self.transport.demote(node, &self.shard).await?;
        if !self.transport.stats(node, &self.shard).await?.intact {
            return Err(self.not_intact(node));
        }

        // Bulk of the gap without holding up writes, the rest under the sequencer
        let first = self.catch_up(routing.primary, node).await?;
        let _turn = self.sequencer.lock().await;
        let primary = self.routing.shard(&self.shard)?.primary;
        let checkpoint = self.catch_up(primary, node).await?;

        self.links.insert(node, self.spawn_link(node, checkpoint));
        self.routing.set_stale(&self.shard, node, false);
        info!(shard = %self.shard, node, first, checkpoint, "replica back in sync");
        Ok(checkpoint)
    }

    /// Replay into `node` every operation the primary has past the node's checkpoint
    async fn catch_up(&self, primary: NodeId, node: NodeId) -> Result<SeqNo> {
        let from = self.transport.local_checkpoint(node, &self.shard).await?;
        let primary_checkpoint = self.transport.local_checkpoint(primary, &self.shard).await?;
        if from > primary_checkpoint {
            return Err(ShoalError::ShardUnavailable {
                shard: self.shard.shard,
                reason: format!(
                    "copy on node {} is ahead of the primary ({} > {})",
                    node, from, primary_checkpoint
                ),
            });
        }
        let ops = self
            .transport
            .operations_since(primary, &self.shard, from)
            .await?;
        let mut checkpoint = from;
        for op in ops {
            checkpoint = self.transport.replicate(node, &self.shard, op).await?;
        }
        debug!(shard = %self.shard, node, from, checkpoint, "replayed primary log");
        Ok(checkpoint)
    }

    /// Promote the reachable replica with the highest checkpoint and route to it
    pub async fn failover(&self) -> Result<NodeId> {
        let _turn = self.sequencer.lock().await;
        let routing = self.routing.shard(&self.shard)?;
        let former = routing.primary;

        let mut best: Option<(NodeId, SeqNo)> = None;
        for &node in &routing.replicas {
            if !self.routing.is_reachable(node) {
                continue;
            }
            match self.transport.stats(node, &self.shard).await {
                Ok(stats) if !stats.intact => {
                    debug!(shard = %self.shard, node, "skipping replica with a refused segment");
                }
                Ok(stats) => {
                    let checkpoint = stats.local_checkpoint;
                    if best.map_or(true, |(_, b)| checkpoint > b) {
                        best = Some((node, checkpoint));
                    }
                }
                Err(e) => {
                    debug!(shard = %self.shard, node, error = %e, "skipping replica for promotion")
                }
            }
        }
        let (primary, checkpoint) = best.ok_or_else(|| ShoalError::ShardUnavailable {
            shard: self.shard.shard,
            reason: "no reachable intact replica to promote".to_string(),
        })?;

        self.transport.promote(primary, &self.shard).await?;
        self.routing.promote(&self.shard, primary)?;
        self.links.remove(&primary);
        self.links.remove(&former);

        // Remaining replicas follow the new primary's history
        let routing = self.routing.shard(&self.shard)?;
        for node in routing.in_sync_replicas().collect::<Vec<_>>() {
            let caught_up = if self.routing.is_reachable(node) {
                self.catch_up(primary, node).await
            } else {
                Err(ShoalError::NodeUnreachable(node))
            };
            match caught_up {
                Ok(replica_checkpoint) => {
                    self.links
                        .insert(node, self.spawn_link(node, replica_checkpoint));
                }
                Err(e) => {
                    warn!(
                        shard = %self.shard,
                        node,
                        error = %e,
                        "replica marked stale during failover"
                    );
                    self.routing.set_stale(&self.shard, node, true);
                }
            }
        }

        info!(shard = %self.shard, former, primary, checkpoint, "failed over to new primary");
        Ok(primary)
    }

    /// Trim logs through what every replica, stale ones included, has acknowledged
    pub async fn trim_log(&self) -> Result<usize> {
        let routing = self.routing.shard(&self.shard)?;
        let mut upto = self
            .transport
            .local_checkpoint(routing.primary, &self.shard)
            .await?;
        for &node in &routing.replicas {
            upto = upto.min(self.acked_checkpoint(node));
        }
        if upto == 0 {
            return Ok(0);
        }
        let removed = self
            .transport
            .trim_log(routing.primary, &self.shard, upto)
            .await?;
        for node in routing.in_sync_replicas() {
            if let Err(e) = self.transport.trim_log(node, &self.shard, upto).await {
                debug!(shard = %self.shard, node, error = %e, "replica log trim failed");
            }
        }
        Ok(removed)
    }
}

/// Deliver forwarded operations to one replica, in order
async fn run_link(
    node: NodeId,
    shard: ShardKey,
    transport: Arc<dyn ShardTransport>,
    routing: Arc<dyn RoutingTable>,
    acked: Arc<AtomicU64>,
    mut rx: mpsc::UnboundedReceiver<Forward>,
) {
    while let Some(forward) = rx.recv().await {
        let seq_no = forward.op.seq_no;
        let stale = routing
            .shard(&shard)
            .map(|r| r.is_stale(node))
            .unwrap_or(true);
        let result = if stale {
            Err(ShoalError::ShardUnavailable {
                shard: shard.shard,
                reason: format!("replica on node {} is stale", node),
            })
        } else {
            let replicate = transport.replicate(node, &shard, forward.op);
            match tokio::time::timeout_at(forward.deadline, replicate).await {
                Ok(result) => result,
                Err(_) => Err(ShoalError::ReplicationTimeout {
                    seq_no,
                    acked: 0,
                    required: 1,
                }),
            }
        };

        match &result {
            Ok(checkpoint) => {
                acked.fetch_max(*checkpoint, Ordering::AcqRel);
            }
            Err(e) if !stale => {
                warn!(shard = %shard, node, seq_no, error = %e, "replica marked stale");
                routing.set_stale(&shard, node, true);
            }
            Err(_) => {}
        }
        let _ = forward.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryRouting, ShardRouting};
    use crate::config::{ShardConfig, TokenizerConfig};
    use crate::models::Document;
    use crate::replication::{Fault, LocalTransport};
    use crate::schema::{FieldMapping, IndexMapping, MappingRegistry};
    use crate::shard::ShardEngine;
    use crate::tokenizer::Tokenizer;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        transport: Arc<LocalTransport>,
        routing: Arc<InMemoryRouting>,
        group: ReplicationGroup,
        key: ShardKey,
    }

    fn harness(quorum: AckQuorum, ack_timeout: Duration) -> Harness {
        let dir = TempDir::new().unwrap();
        let key = ShardKey::new("idx", 0);
        let mapping = Arc::new(MappingRegistry::new(
            IndexMapping::new().field("title", FieldMapping::text()),
        ));
        let tokenizer = Arc::new(Tokenizer::new(&TokenizerConfig::default()).unwrap());
        let transport = Arc::new(LocalTransport::new());
        for node in 1..=3u64 {
            let engine = ShardEngine::open(
                key.clone(),
                dir.path().join(format!("node{}", node)),
                ShardConfig::default().with_refresh_interval(None),
                mapping.clone(),
                tokenizer.clone(),
                node == 1,
            )
            .unwrap();
            transport.register(node, engine);
        }
        let routing = Arc::new(InMemoryRouting::new());
        routing.assign(key.clone(), ShardRouting::new(1, vec![2, 3]));
        let group = ReplicationGroup::new(
            key.clone(),
            transport.clone(),
            routing.clone(),
            ReplicationConfig {
                quorum,
                ack_timeout_ms: ack_timeout.as_millis() as u64,
            },
        );
        Harness {
            _dir: dir,
            transport,
            routing,
            group,
            key,
        }
    }

    fn index(key: &str) -> WriteRequest {
        WriteRequest::Index {
            key: key.to_string(),
            doc: Document::new().with_text("title", key),
        }
    }

    fn checkpoint(h: &Harness, node: NodeId) -> SeqNo {
        h.transport.engine(node, &h.key).unwrap().local_checkpoint()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_reaches_every_copy() {
        let h = harness(AckQuorum::All, Duration::from_secs(2));
        let resp = h.group.write(index("a")).await.unwrap();
        assert_eq!(resp.seq_no, Some(1));
        for node in 1..=3 {
            assert_eq!(checkpoint(&h, node), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_count_quorum_rejects_before_admission() {
        let h = harness(AckQuorum::Count(3), Duration::from_millis(200));
        h.routing.set_stale(&h.key, 3, true);
        assert!(matches!(
            h.group.write(index("a")).await,
            Err(ShoalError::InsufficientCopies {
                required: 3,
                available: 2
            })
        ));
        assert_eq!(checkpoint(&h, 1), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hung_replica_is_marked_stale_and_recovers() {
        let h = harness(AckQuorum::Majority, Duration::from_millis(200));
        h.transport.inject(3, Fault::Hang);

        h.group.write(index("a")).await.unwrap();
        h.group.write(index("b")).await.unwrap();
        // The link gives up on node 3 at the ack deadline
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(h.routing.shard(&h.key).unwrap().is_stale(3));
        assert_eq!(checkpoint(&h, 3), 0);

        h.transport.heal(3);
        let recovered = h.group.recover_replica(3).await.unwrap();
        assert_eq!(recovered, 2);
        assert!(!h.routing.shard(&h.key).unwrap().is_stale(3));

        h.group.set_quorum(AckQuorum::All);
        h.group.write(index("c")).await.unwrap();
        assert_eq!(checkpoint(&h, 3), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failover_promotes_highest_checkpoint() {
        let h = harness(AckQuorum::All, Duration::from_millis(200));
        h.group.write(index("a")).await.unwrap();
        h.group.set_quorum(AckQuorum::Majority);
        h.transport.inject(3, Fault::Unreachable);
        h.group.write(index("b")).await.unwrap();

        h.transport.inject(1, Fault::Unreachable);
        h.routing.set_reachable(1, false);
        let primary = h.group.failover().await.unwrap();
        assert_eq!(primary, 2);
        assert!(h.transport.engine(2, &h.key).unwrap().is_primary());
        let routing = h.routing.shard(&h.key).unwrap();
        assert!(routing.is_stale(1) && routing.is_stale(3));

        // Only one copy in sync: a majority of three is out of reach
        assert!(matches!(
            h.group.write(index("c")).await,
            Err(ShoalError::InsufficientCopies { required: 2, available: 1 })
        ));

        h.transport.heal(3);
        assert_eq!(h.group.recover_replica(3).await.unwrap(), 2);
        let resp = h.group.write(index("c")).await.unwrap();
        assert_eq!(resp.seq_no, Some(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trim_is_held_back_by_stale_replica() {
        let h = harness(AckQuorum::All, Duration::from_millis(200));
        h.group.write(index("a")).await.unwrap();
        h.group.set_quorum(AckQuorum::Majority);
        h.transport.inject(3, Fault::Unreachable);
        h.group.write(index("b")).await.unwrap();
        for node in 1..=2 {
            h.transport.engine(node, &h.key).unwrap().refresh().unwrap();
        }

        h.group.trim_log().await.unwrap();
        let primary = h.transport.engine(1, &h.key).unwrap();
        // Node 3 acknowledged only seq 1
        assert!(primary.operations_since(1).is_ok());
        assert!(primary.operations_since(0).is_err());
    }
}
