//! Reader snapshots and search contexts
//!
//! A `ShardSnapshot` is the published, read-only state of a shard copy: the
//! segment list with the live bitsets captured at the last refresh or merge.
//! Queries run against one snapshot from phase 1 through phase 2; the search
//! context keeps it (and thus its segments) alive until released or expired.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Document, SeqNo};
use crate::query::{Bm25Scorer, DocAddress, LocalTopDocs, ShardStatistics};
use crate::segment::{SegmentId, SegmentView};

/// Identifier of an open search context on one shard copy
pub type ContextId = u64;

/// Phase 1 answer of one shard copy: its local top hits, pinned under a context
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShardQueryResult {
    pub context: ContextId,
    pub top: LocalTopDocs,
}

/// Published segment views of a shard copy
#[derive(Clone, Debug, Default)]
pub struct ShardSnapshot {
    /// Incremented on every publish
    pub generation: u64,
    /// Every operation up to this seq no is reflected
    pub refresh_seq: SeqNo,
    /// Generation order
    pub views: Vec<SegmentView>,
}

impl ShardSnapshot {
    pub fn new(generation: u64, refresh_seq: SeqNo, views: Vec<SegmentView>) -> Self {
        Self {
            generation,
            refresh_seq,
            views,
        }
    }

    pub fn view(&self, id: SegmentId) -> Option<&SegmentView> {
        self.views.iter().find(|v| v.segment.id() == id)
    }

    /// Live documents visible in this snapshot
    pub fn live_doc_count(&self) -> u64 {
        self.views.iter().map(|v| v.live_count()).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.views.len()
    }

    pub fn statistics(&self, scorer: Bm25Scorer) -> ShardStatistics {
        ShardStatistics::new(&self.views, scorer)
    }

    /// Stored document at `address`, `None` when the address is unknown here
    pub fn fetch(&self, address: &DocAddress) -> Result<Option<Document>> {
        match self.view(address.segment) {
            Some(view) if view.live.contains(address.docno.0) => {
                view.segment.stored_document(address.docno)
            }
            _ => Ok(None),
        }
    }
}

struct SearchContext {
    snapshot: Arc<ShardSnapshot>,
    last_access: Instant,
}

/// Open search contexts of one shard copy
pub struct SearchContexts {
    next_id: AtomicU64,
    contexts: DashMap<ContextId, SearchContext>,
    keep_alive: Duration,
}

impl SearchContexts {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            contexts: DashMap::new(),
            keep_alive,
        }
    }

    /// Pin `snapshot` under a new context id
    pub fn open(&self, snapshot: Arc<ShardSnapshot>) -> ContextId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.contexts.insert(
            id,
            SearchContext {
                snapshot,
                last_access: Instant::now(),
            },
        );
        id
    }

    pub fn get(&self, id: ContextId) -> Option<Arc<ShardSnapshot>> {
        self.contexts.get_mut(&id).map(|mut ctx| {
            ctx.last_access = Instant::now();
            ctx.snapshot.clone()
        })
    }

    pub fn release(&self, id: ContextId) -> bool {
        self.contexts.remove(&id).is_some()
    }

    /// Drop contexts idle for longer than the keep-alive; returns how many
    pub fn expire(&self) -> usize {
        let before = self.contexts.len();
        let keep_alive = self.keep_alive;
        self.contexts
            .retain(|_, ctx| ctx.last_access.elapsed() < keep_alive);
        before - self.contexts.len()
    }

    pub fn clear(&self) {
        self.contexts.clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::nodes::test_support::build_segment;
    use crate::segment::DocNo;

    #[test]
    fn test_fetch_respects_snapshot_liveness() {
        let segment = build_segment(1, &[("a", "x"), ("b", "y")]);
        let snapshot = ShardSnapshot::new(1, 2, vec![SegmentView::new(segment.clone())]);
        segment.delete(DocNo(0));

        // Deleted after capture: still visible to this snapshot
        let addr = DocAddress {
            segment: segment.id(),
            docno: DocNo(0),
        };
        assert!(snapshot.fetch(&addr).unwrap().is_some());
        assert_eq!(snapshot.live_doc_count(), 2);

        let missing = DocAddress {
            segment: SegmentId::new(99),
            docno: DocNo(0),
        };
        assert!(snapshot.fetch(&missing).unwrap().is_none());
    }

    #[test]
    fn test_contexts_pin_and_release() {
        let segment = build_segment(1, &[("a", "x")]);
        let contexts = SearchContexts::new(Duration::from_secs(60));
        let id = contexts.open(Arc::new(ShardSnapshot::new(
            1,
            1,
            vec![SegmentView::new(segment.clone())],
        )));

        assert!(Arc::strong_count(&segment) > 1);
        assert!(contexts.get(id).is_some());
        assert!(contexts.release(id));
        assert!(!contexts.release(id));
        assert_eq!(Arc::strong_count(&segment), 1);
    }

    #[test]
    fn test_idle_contexts_expire() {
        let contexts = SearchContexts::new(Duration::ZERO);
        contexts.open(Arc::new(ShardSnapshot::default()));
        assert_eq!(contexts.expire(), 1);
        assert!(contexts.is_empty());
    }
}
