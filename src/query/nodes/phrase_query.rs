//! Phrase query - matches terms in order, optionally with slop
//!
//! Candidates come from the conjunction of the phrase terms; positions are
//! then checked per document. With `slop = 0` every term must sit exactly at
//! its offset from the first term. With a larger slop the terms must still
//! appear in order, and the summed distance between expected and actual gaps
//! may not exceed the slop.

use std::collections::HashMap;

use crate::query::ast::{Matches, QueryNode};
use crate::query::context::QueryContext;
use crate::segment::{intersect, DocCursor, Term};
use crate::Result;

/// Query that matches an ordered sequence of analyzed terms
#[derive(Clone, Debug)]
pub struct PhraseQuery {
    /// Terms with their positions relative to the first phrase token
    pub terms: Vec<(Term, u32)>,
    pub slop: u32,
}

impl PhraseQuery {
    pub fn new(terms: Vec<(Term, u32)>, slop: u32) -> Self {
        Self { terms, slop }
    }
}

impl QueryNode for PhraseQuery {
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        if self.terms.is_empty() {
            return Ok(Matches::empty());
        }
        let mut iterators = Vec::with_capacity(self.terms.len());
        for (term, _) in &self.terms {
            match ctx.postings(term)? {
                Some(postings) => iterators.push(postings),
                None => return Ok(Matches::empty()),
            }
        }
        let idfs: Vec<f32> = self.terms.iter().map(|(t, _)| ctx.stats().idf(t)).collect();
        let offsets: Vec<u32> = self.terms.iter().map(|(_, p)| *p).collect();

        let mut scores = HashMap::new();
        let mut conjunction = intersect(iterators);
        while let Some(docno) = conjunction.next_doc() {
            let positions: Vec<&[u32]> =
                conjunction.cursors().iter().map(|c| c.positions()).collect();
            let freq = phrase_frequency(&positions, &offsets, self.slop);
            if freq == 0 {
                continue;
            }
            let score = self
                .terms
                .iter()
                .zip(&idfs)
                .map(|((term, _), idf)| ctx.term_score(term, docno, freq, *idf))
                .sum::<f32>();
            scores.insert(docno.0, score);
        }
        Ok(Matches::scored(scores))
    }

    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64 {
        self.terms
            .iter()
            .map(|(t, _)| ctx.segment().doc_frequency(t) as u64)
            .min()
            .unwrap_or(0)
    }

    fn query_type(&self) -> &'static str {
        "phrase"
    }

    fn clone_box(&self) -> Box<dyn QueryNode> {
        Box::new(self.clone())
    }
}

/// Number of start positions of the first term that begin a phrase match
fn phrase_frequency(positions: &[&[u32]], offsets: &[u32], slop: u32) -> u32 {
    let mut freq = 0;
    for &start in positions[0] {
        let mut prev = start;
        let mut cost = 0u32;
        let mut matched = true;
        for i in 1..positions.len() {
            let gap = offsets[i].saturating_sub(offsets[i - 1]);
            match closest_after(positions[i], prev, prev + gap) {
                Some(p) => {
                    cost += p.abs_diff(prev + gap);
                    prev = p;
                }
                None => {
                    matched = false;
                    break;
                }
            }
            if cost > slop {
                matched = false;
                break;
            }
        }
        if matched {
            freq += 1;
        }
    }
    freq
}

/// The position strictly after `after` that is closest to `target`
fn closest_after(positions: &[u32], after: u32, target: u32) -> Option<u32> {
    let idx = positions.partition_point(|&p| p < target);
    let above = positions.get(idx).copied();
    let below = idx
        .checked_sub(1)
        .and_then(|i| positions.get(i).copied())
        .filter(|&p| p > after);
    match (below, above) {
        (Some(b), Some(a)) => Some(if target - b <= a - target { b } else { a }),
        (b, a) => b.or(a),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::nodes::test_support::Fixture;

    fn phrase(words: &[&str], slop: u32) -> PhraseQuery {
        PhraseQuery::new(
            words
                .iter()
                .enumerate()
                .map(|(i, w)| (Term::new("body", *w), i as u32))
                .collect(),
            slop,
        )
    }

    #[test]
    fn test_exact_phrase() {
        let fx = Fixture::new(&[
            ("1", "the cat sat"),
            ("2", "sat cat"),
            ("3", "cat big sat"),
        ]);
        let ctx = fx.context(0);
        let m = phrase(&["cat", "sat"], 0).execute(&ctx).unwrap();
        assert_eq!(fx.keys(&m), vec!["1"]);
    }

    #[test]
    fn test_slop_allows_gaps_in_order() {
        let fx = Fixture::new(&[("1", "cat big sat"), ("2", "sat cat")]);
        let ctx = fx.context(0);
        let m = phrase(&["cat", "sat"], 1).execute(&ctx).unwrap();
        assert_eq!(fx.keys(&m), vec!["1"]);
    }

    #[test]
    fn test_phrase_frequency_counts_occurrences() {
        let positions: Vec<&[u32]> = vec![&[0, 5, 9], &[1, 6]];
        assert_eq!(phrase_frequency(&positions, &[0, 1], 0), 2);
        // The last "cat" has no "sat" after it at any slop
        assert_eq!(phrase_frequency(&positions, &[0, 1], 3), 2);

        let spread: Vec<&[u32]> = vec![&[0], &[3]];
        assert_eq!(phrase_frequency(&spread, &[0, 1], 1), 0);
        assert_eq!(phrase_frequency(&spread, &[0, 1], 2), 1);
        assert_eq!(closest_after(&[1, 6], 9, 10), None);
        assert_eq!(closest_after(&[1, 6], 0, 2), Some(1));
    }
}
