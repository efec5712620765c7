//! Executable query tree
//!
//! A [`Query`](super::Query) is planned into a tree of `QueryNode`s. Each node
//! runs against one segment at a time and returns the matching docnos with
//! their score contributions. Liveness is applied by the executor, so nodes
//! may report deleted documents.

use std::collections::HashMap;
use std::fmt::Debug;

use roaring::RoaringBitmap;

use super::context::QueryContext;
use crate::Result;

/// Matching docnos of one segment with their scores
#[derive(Clone, Debug, Default)]
pub struct Matches {
    pub docs: RoaringBitmap,
    scores: HashMap<u32, f32>,
    /// Score of matching docs absent from `scores`
    constant: f32,
}

impl Matches {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every doc scores `score`
    pub fn constant(docs: RoaringBitmap, score: f32) -> Self {
        Self {
            docs,
            scores: HashMap::new(),
            constant: score,
        }
    }

    /// Per-doc scores; the doc set is the key set
    pub fn scored(scores: HashMap<u32, f32>) -> Self {
        let docs = scores.keys().copied().collect();
        Self {
            docs,
            scores,
            constant: 0.0,
        }
    }

    pub fn score(&self, docno: u32) -> f32 {
        self.scores.get(&docno).copied().unwrap_or(self.constant)
    }

    pub fn len(&self) -> u64 {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Keep only docs also in `other`
    pub fn retain(&mut self, other: &RoaringBitmap) {
        self.docs &= other;
        if !self.scores.is_empty() {
            let docs = &self.docs;
            self.scores.retain(|d, _| docs.contains(*d));
        }
    }
}

/// Core trait for all query nodes
pub trait QueryNode: Send + Sync + Debug {
    /// Matching docnos of the context's segment, scored
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches>;

    /// Rough number of matches, used to run cheap clauses first
    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64;

    /// Query type name for logging
    fn query_type(&self) -> &'static str;

    /// Whether this node contributes to relevance scores
    fn is_scoring(&self) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn QueryNode>;
}

impl Clone for Box<dyn QueryNode> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A query that matches no documents
#[derive(Clone, Debug, Default)]
pub struct MatchNoneQuery;

impl QueryNode for MatchNoneQuery {
    fn execute(&self, _ctx: &QueryContext<'_>) -> Result<Matches> {
        Ok(Matches::empty())
    }

    fn estimate_cost(&self, _ctx: &QueryContext<'_>) -> u64 {
        0
    }

    fn query_type(&self) -> &'static str {
        "match_none"
    }

    fn is_scoring(&self) -> bool {
        false
    }

    fn clone_box(&self) -> Box<dyn QueryNode> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_scoring() {
        let mut scores = HashMap::new();
        scores.insert(1, 2.5);
        scores.insert(4, 1.0);
        let mut m = Matches::scored(scores);
        assert_eq!(m.len(), 2);
        assert_eq!(m.score(1), 2.5);
        assert_eq!(m.score(9), 0.0);

        let keep: RoaringBitmap = [4u32, 5].into_iter().collect();
        m.retain(&keep);
        assert_eq!(m.len(), 1);
        assert_eq!(m.score(1), 0.0);
        assert_eq!(m.score(4), 1.0);
    }

    #[test]
    fn test_constant_matches() {
        let docs: RoaringBitmap = (0..10).collect();
        let m = Matches::constant(docs, 1.0);
        assert_eq!(m.score(3), 1.0);
        assert!(!m.is_empty());
        assert!(Matches::empty().is_empty());
    }
}
