//! Match query - full-text search over analyzed terms

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::query::ast::{Matches, QueryNode};
use crate::query::context::QueryContext;
use crate::segment::{intersect, DocCursor, Term};
use crate::Result;

/// How the terms of a match query combine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// At least one term must match
    #[default]
    Or,
    /// Every term must match
    And,
}

/// Query over the analyzed terms of a text; the score is the sum of the
/// BM25 contributions of the terms a document contains
#[derive(Clone, Debug)]
pub struct MatchQuery {
    pub terms: Vec<Term>,
    pub operator: Operator,
}

impl MatchQuery {
    pub fn new(terms: Vec<Term>, operator: Operator) -> Self {
        Self { terms, operator }
    }

    fn execute_or(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        let mut scores: HashMap<u32, f32> = HashMap::new();
        for term in &self.terms {
            let Some(postings) = ctx.postings(term)? else {
                continue;
            };
            let idf = ctx.stats().idf(term);
            for (docno, tf) in postings {
                *scores.entry(docno.0).or_insert(0.0) += ctx.term_score(term, docno, tf, idf);
            }
        }
        Ok(Matches::scored(scores))
    }

    fn execute_and(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        let mut iterators = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            match ctx.postings(term)? {
                Some(postings) => iterators.push(postings),
                // A missing term empties the conjunction
                None => return Ok(Matches::empty()),
            }
        }
        let idfs: Vec<f32> = self.terms.iter().map(|t| ctx.stats().idf(t)).collect();

        let mut scores = HashMap::new();
        let mut conjunction = intersect(iterators);
        while let Some(docno) = conjunction.next_doc() {
            let score = conjunction
                .cursors()
                .iter()
                .zip(&self.terms)
                .zip(&idfs)
                .map(|((cursor, term), idf)| {
                    ctx.term_score(term, docno, cursor.term_frequency(), *idf)
                })
                .sum::<f32>();
            scores.insert(docno.0, score);
        }
        Ok(Matches::scored(scores))
    }
}

impl QueryNode for MatchQuery {
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        if self.terms.is_empty() {
            return Ok(Matches::empty());
        }
        match self.operator {
            Operator::Or => self.execute_or(ctx),
            Operator::And => self.execute_and(ctx),
        }
    }

    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64 {
        let dfs = self
            .terms
            .iter()
            .map(|t| ctx.segment().doc_frequency(t) as u64);
        match self.operator {
            Operator::Or => dfs.sum(),
            Operator::And => dfs.min().unwrap_or(0),
        }
    }

    fn query_type(&self) -> &'static str {
        "match"
    }

    fn clone_box(&self) -> Box<dyn QueryNode> {
        Box::new(self.clone())
    }
}
