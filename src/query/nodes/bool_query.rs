//! Boolean query - combines clauses with AND, OR, NOT semantics

use std::collections::HashMap;

use roaring::RoaringBitmap;

use crate::query::ast::{Matches, QueryNode};
use crate::query::context::QueryContext;
use crate::Result;

/// Boolean query combining multiple clauses
///
/// - `must`: every clause must match; scores add up.
/// - `should`: at least one must match when there is no `must` or `filter`,
///   otherwise optional; matching clauses add to the score.
/// - `must_not`: no clause may match; no score.
/// - `filter`: every clause must match; no score.
///
/// A bool query with only `must_not` clauses (or none at all) starts from
/// every live document.
#[derive(Clone, Debug, Default)]
pub struct BoolQuery {
    pub must: Vec<Box<dyn QueryNode>>,
    pub should: Vec<Box<dyn QueryNode>>,
    pub must_not: Vec<Box<dyn QueryNode>>,
    pub filter: Vec<Box<dyn QueryNode>>,
}

impl BoolQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, query: impl QueryNode + 'static) -> Self {
        self.must.push(Box::new(query));
        self
    }

    pub fn should(mut self, query: impl QueryNode + 'static) -> Self {
        self.should.push(Box::new(query));
        self
    }

    pub fn must_not(mut self, query: impl QueryNode + 'static) -> Self {
        self.must_not.push(Box::new(query));
        self
    }

    pub fn filter(mut self, query: impl QueryNode + 'static) -> Self {
        self.filter.push(Box::new(query));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
            && self.should.is_empty()
            && self.must_not.is_empty()
            && self.filter.is_empty()
    }

    pub fn clause_count(&self) -> usize {
        self.must.len() + self.should.len() + self.must_not.len() + self.filter.len()
    }
}

/// Clauses ordered cheapest first, so conjunctions can stop early
fn by_cost<'q>(
    clauses: &'q [Box<dyn QueryNode>],
    ctx: &QueryContext<'_>,
) -> Vec<&'q dyn QueryNode> {
    let mut ordered: Vec<(u64, &dyn QueryNode)> =
        clauses.iter().map(|c| (c.estimate_cost(ctx), c.as_ref())).collect();
    ordered.sort_by_key(|(cost, _)| *cost);
    ordered.into_iter().map(|(_, c)| c).collect()
}

impl QueryNode for BoolQuery {
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        let mut required: Option<RoaringBitmap> = None;

        // Filters first, then must clauses
        for clause in by_cost(&self.filter, ctx) {
            let m = clause.execute(ctx)?;
            required = Some(match required {
                Some(r) => r & m.docs,
                None => m.docs,
            });
            if required.as_ref().is_some_and(|r| r.is_empty()) {
                return Ok(Matches::empty());
            }
        }

        let mut must_matches = Vec::with_capacity(self.must.len());
        for clause in by_cost(&self.must, ctx) {
            let m = clause.execute(ctx)?;
            let docs = match required {
                Some(r) => r & &m.docs,
                None => m.docs.clone(),
            };
            let empty = docs.is_empty();
            required = Some(docs);
            must_matches.push(m);
            if empty {
                return Ok(Matches::empty());
            }
        }

        let mut should_matches = Vec::with_capacity(self.should.len());
        for clause in &self.should {
            should_matches.push(clause.execute(ctx)?);
        }

        let mut docs = match required {
            Some(r) => r,
            None if !should_matches.is_empty() => {
                let mut union = RoaringBitmap::new();
                for m in &should_matches {
                    union |= &m.docs;
                }
                union
            }
            None => ctx.live().clone(),
        };

        for clause in &self.must_not {
            if docs.is_empty() {
                break;
            }
            docs -= &clause.execute(ctx)?.docs;
        }

        if must_matches.is_empty() && should_matches.is_empty() {
            // Pure filtering; a bare must_not or empty bool behaves like match_all
            let score = if self.filter.is_empty() { 1.0 } else { 0.0 };
            return Ok(Matches::constant(docs, score));
        }

        let scores: HashMap<u32, f32> = docs
            .iter()
            .map(|doc| {
                let must: f32 = must_matches.iter().map(|m| m.score(doc)).sum();
                let should: f32 = should_matches
                    .iter()
                    .filter(|m| m.docs.contains(doc))
                    .map(|m| m.score(doc))
                    .sum();
                (doc, must + should)
            })
            .collect();
        Ok(Matches::scored(scores))
    }

    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64 {
        let required = self
            .must
            .iter()
            .chain(&self.filter)
            .map(|c| c.estimate_cost(ctx))
            .min();
        match required {
            Some(cost) => cost,
            None if !self.should.is_empty() => {
                self.should.iter().map(|c| c.estimate_cost(ctx)).sum()
            }
            None => ctx.live().len(),
        }
    }

    fn query_type(&self) -> &'static str {
        "bool"
    }

    fn is_scoring(&self) -> bool {
        self.must.iter().chain(&self.should).any(|c| c.is_scoring())
    }

    fn clone_box(&self) -> Box<dyn QueryNode> {
        Box::new(self.clone())
    }
}
