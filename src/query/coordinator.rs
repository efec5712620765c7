//! Two-phase distributed search
//!
//! Phase 1 asks one copy of every shard for its local top `from + size`
//! under a search context. Phase 2 merges the shard lists, keeps the global
//! window and fetches stored documents for exactly those hits from the
//! contexts that produced them. Every context is released afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::time::timeout_at;
use tracing::{debug, warn};

use crate::cluster::RoutingTable;
use crate::error::{Result, ShoalError};
use crate::models::{NodeId, SearchHit, SearchRequest, SearchResponse, ShardFailure, ShardKey};
use crate::query::executor::{compare_hits, DocAddress, LocalHit};
use crate::replication::ShardTransport;
use crate::shard::{ContextId, ShardQueryResult};

/// Phase 1 answer of one shard copy
struct ShardAnswer {
    shard: ShardKey,
    node: NodeId,
    result: ShardQueryResult,
}

/// A hit with the shard copy and context it came from
struct Candidate {
    answer: usize,
    hit: LocalHit,
}

pub struct QueryCoordinator {
    transport: Arc<dyn ShardTransport>,
    routing: Arc<dyn RoutingTable>,
}

impl QueryCoordinator {
    pub fn new(transport: Arc<dyn ShardTransport>, routing: Arc<dyn RoutingTable>) -> Self {
        Self { transport, routing }
    }

    /// Search `shards`. A shard that fails or misses its deadline is left out
    /// and reported; only an invalid query fails the whole search.
    pub async fn search(
        &self,
        shards: &[ShardKey],
        request: &SearchRequest,
        default_timeout: Duration,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let budget = request.timeout.unwrap_or(default_timeout);

        let phase1 = join_all(
            shards
                .iter()
                .map(|shard| self.query_shard(shard, request, budget)),
        )
        .await;

        let mut answers = Vec::with_capacity(shards.len());
        let mut failed_shards = Vec::new();
        let mut invalid = None;
        for (shard, outcome) in shards.iter().zip(phase1) {
            match outcome {
                Ok(answer) => answers.push(answer),
                Err(e @ ShoalError::InvalidQuery(_)) => {
                    invalid.get_or_insert(e);
                }
                Err(e) => {
                    warn!(shard = %shard, error = %e, "shard left out of search");
                    failed_shards.push(ShardFailure {
                        shard: shard.shard,
                        reason: e.to_string(),
                    });
                }
            }
        }
        if let Some(e) = invalid {
            self.release_all(&answers);
            return Err(e);
        }

        let total_approx = answers.iter().map(|a| a.result.top.total_matched).sum();
        let mut candidates: Vec<Candidate> = answers
            .iter()
            .enumerate()
            .flat_map(|(i, a)| {
                a.result
                    .top
                    .hits
                    .iter()
                    .cloned()
                    .map(move |hit| Candidate { answer: i, hit })
            })
            .collect();
        candidates.sort_by(|a, b| compare_hits(&a.hit, &b.hit, request.sort.as_ref()));
        let window: Vec<Candidate> = candidates
            .into_iter()
            .skip(request.from)
            .take(request.size)
            .collect();

        let mut hits: Vec<SearchHit> = window
            .iter()
            .map(|c| SearchHit {
                key: c.hit.key.clone(),
                score: c.hit.score,
                shard: answers[c.answer].shard.shard,
                sort_value: c.hit.sort_value.clone(),
                document: None,
            })
            .collect();

        if request.fetch_documents && !hits.is_empty() {
            let fetch_failures = self.fetch_window(&answers, &window, &mut hits, budget).await;
            failed_shards.extend(fetch_failures);
        }

        self.release_all(&answers);

        let partial = !failed_shards.is_empty();
        if partial {
            debug!(failed = failed_shards.len(), "partial search response");
        }
        Ok(SearchResponse {
            hits,
            total_approx,
            partial,
            failed_shards,
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Phase 1 against the first serving copy that answers before the deadline
    async fn query_shard(
        &self,
        shard: &ShardKey,
        request: &SearchRequest,
        budget: Duration,
    ) -> Result<ShardAnswer> {
        let deadline = tokio::time::Instant::now() + budget;
        let routing = self.routing.shard(shard)?;
        let mut last_error = None;

        for node in routing.serving_copies() {
            if !self.routing.is_reachable(node) {
                continue;
            }
            let query = self.transport.query(node, shard, request.clone());
            match timeout_at(deadline, query).await {
                Ok(Ok(result)) => {
                    return Ok(ShardAnswer {
                        shard: shard.clone(),
                        node,
                        result,
                    })
                }
                Ok(Err(e)) if e.is_retriable() => {
                    debug!(shard = %shard, node, error = %e, "copy failed, trying next");
                    last_error = Some(e);
                }
                // Another copy would fail the same way, e.g. an invalid query
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(ShoalError::ShardUnavailable {
                        shard: shard.shard,
                        reason: format!("no response within {:?}", budget),
                    })
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ShoalError::ShardUnavailable {
            shard: shard.shard,
            reason: "no reachable copy".to_string(),
        }))
    }

    /// Phase 2: fetch the window's documents, one call per contributing copy
    async fn fetch_window(
        &self,
        answers: &[ShardAnswer],
        window: &[Candidate],
        hits: &mut [SearchHit],
        budget: Duration,
    ) -> Vec<ShardFailure> {
        let mut groups: BTreeMap<usize, Vec<(usize, DocAddress)>> = BTreeMap::new();
        for (pos, c) in window.iter().enumerate() {
            groups.entry(c.answer).or_default().push((pos, c.hit.address));
        }

        let deadline = tokio::time::Instant::now() + budget;
        let calls = groups.into_iter().map(|(answer, slots)| {
            let a = &answers[answer];
            let addresses: Vec<DocAddress> = slots.iter().map(|(_, addr)| *addr).collect();
            async move {
                let fetched = timeout_at(
                    deadline,
                    self.transport
                        .fetch(a.node, &a.shard, a.result.context, addresses),
                )
                .await;
                (a, slots, fetched)
            }
        });

        let mut failures = Vec::new();
        for (a, slots, fetched) in join_all(calls).await {
            let documents = match fetched {
                Ok(Ok(documents)) => documents,
                Ok(Err(e)) => {
                    failures.push(ShardFailure {
                        shard: a.shard.shard,
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(_) => {
                    failures.push(ShardFailure {
                        shard: a.shard.shard,
                        reason: format!("fetch missed the {:?} deadline", budget),
                    });
                    continue;
                }
            };
            for ((pos, _), document) in slots.into_iter().zip(documents) {
                hits[pos].document = document;
            }
        }
        failures
    }

    /// Release every phase 1 context without waiting on the copies
    fn release_all(&self, answers: &[ShardAnswer]) {
        let mut contexts: HashMap<(NodeId, ShardKey), Vec<ContextId>> = HashMap::new();
        for a in answers {
            contexts
                .entry((a.node, a.shard.clone()))
                .or_default()
                .push(a.result.context);
        }
        for ((node, shard), ids) in contexts {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                for id in ids {
                    if let Err(e) = transport.release(node, &shard, id).await {
                        debug!(
                            shard = %shard,
                            node,
                            context = id,
                            error = %e,
                            "context release failed"
                        );
                    }
                }
            });
        }
    }
}
