//! Local query execution
//!
//! Runs a plan against every segment of a shard snapshot and keeps the local
//! top-K in a bounded heap. Hits carry a doc address so phase 2 can fetch the
//! stored document from the same snapshot.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::models::{DocKey, SearchRequest, SortSpec, SortValue};
use crate::query::context::{QueryContext, ShardStatistics};
use crate::query::planner::QueryPlan;
use crate::segment::{DocNo, SegmentId, SegmentView};
use crate::Result;

/// Location of a document inside one shard snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocAddress {
    pub segment: SegmentId,
    pub docno: DocNo,
}

/// One locally ranked hit
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalHit {
    pub key: DocKey,
    pub score: f32,
    pub sort_value: Option<SortValue>,
    pub address: DocAddress,
}

/// Phase 1 result of one shard
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalTopDocs {
    /// Best first, at most `from + size`
    pub hits: Vec<LocalHit>,
    /// Live documents that matched, before truncation
    pub total_matched: u64,
}

/// Ranking order: by the sort spec when given (missing values last), else by
/// score descending; ties are broken by key ascending. `Less` ranks first.
pub fn compare_hits(a: &LocalHit, b: &LocalHit, sort: Option<&SortSpec>) -> Ordering {
    let primary = match sort {
        Some(spec) => {
            let missing = SortValue::Missing;
            let av = a.sort_value.as_ref().unwrap_or(&missing);
            let bv = b.sort_value.as_ref().unwrap_or(&missing);
            av.compare(bv, spec.order)
        }
        None => b.score.total_cmp(&a.score),
    };
    primary.then_with(|| a.key.cmp(&b.key))
}

/// Heap entry whose greatest element is the worst ranked hit
struct Ranked<'s> {
    hit: LocalHit,
    sort: Option<&'s SortSpec>,
}

impl PartialEq for Ranked<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked<'_> {}

impl PartialOrd for Ranked<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_hits(&self.hit, &other.hit, self.sort)
    }
}

/// Query executor for one shard snapshot
pub struct QueryExecutor;

impl QueryExecutor {
    /// Execute `plan` over `views` and return the best `request.shard_window()` hits
    pub fn execute(
        plan: &QueryPlan,
        views: &[SegmentView],
        stats: &ShardStatistics,
        request: &SearchRequest,
    ) -> Result<LocalTopDocs> {
        let top_k = request.shard_window();
        let sort = request.sort.as_ref();
        // The window is caller supplied; never reserve past what the snapshot can match
        let live: u64 = views.iter().map(|v| v.live_count()).sum();
        let capacity = usize::try_from(live).map_or(top_k, |live| top_k.min(live));
        let mut heap: BinaryHeap<Ranked<'_>> =
            BinaryHeap::with_capacity(capacity.saturating_add(1));
        let mut total_matched = 0u64;

        for view in views {
            let ctx = QueryContext::new(view, stats, &request.boosts);
            let mut matches = plan.root.execute(&ctx)?;
            matches.retain(&view.live);
            total_matched += matches.len();
            if top_k == 0 {
                continue;
            }

            let segment = &view.segment;
            for doc in matches.docs.iter() {
                let docno = DocNo(doc);
                let Some(key) = segment.key(docno) else {
                    continue;
                };
                let sort_value =
                    sort.map(|spec| SortValue::from_field(segment.values_for(&spec.field, docno)));
                let candidate = Ranked {
                    hit: LocalHit {
                        key: key.to_string(),
                        score: matches.score(doc),
                        sort_value,
                        address: DocAddress {
                            segment: segment.id(),
                            docno,
                        },
                    },
                    sort,
                };
                if heap.len() < top_k {
                    heap.push(candidate);
                } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                    heap.pop();
                    heap.push(candidate);
                }
            }
        }

        let hits = heap.into_sorted_vec().into_iter().map(|r| r.hit).collect();
        Ok(LocalTopDocs {
            hits,
            total_matched,
        })
    }
}
