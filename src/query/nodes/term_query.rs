//! Term query - exact match on a field

use std::collections::HashMap;

use crate::query::ast::{Matches, QueryNode};
use crate::query::context::QueryContext;
use crate::segment::Term;
use crate::Result;

/// Query that matches documents containing an exact, already analyzed term
///
/// The posting list is read once; each posting is scored with BM25 against
/// the shard-wide document frequency of the term.
#[derive(Clone, Debug)]
pub struct TermQuery {
    pub term: Term,
}

impl TermQuery {
    pub fn new(field: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            term: Term::new(field, token),
        }
    }
}

impl QueryNode for TermQuery {
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        let Some(postings) = ctx.postings(&self.term)? else {
            return Ok(Matches::empty());
        };
        let idf = ctx.stats().idf(&self.term);
        let scores: HashMap<u32, f32> = postings
            .map(|(docno, tf)| (docno.0, ctx.term_score(&self.term, docno, tf, idf)))
            .collect();
        Ok(Matches::scored(scores))
    }

    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64 {
        ctx.segment().doc_frequency(&self.term) as u64
    }

    fn query_type(&self) -> &'static str {
        "term"
    }

    fn clone_box(&self) -> Box<dyn QueryNode> {
        Box::new(self.clone())
    }
}
