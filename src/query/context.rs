//! Query execution context
//!
//! `ShardStatistics` carries the shard-wide numbers BM25 needs (document count,
//! document frequencies, average field lengths) for one reader snapshot.
//! `QueryContext` binds them to the single segment a node is executing against.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use roaring::RoaringBitmap;

use super::scorer::Bm25Scorer;
use crate::error::Result;
use crate::segment::{
    CollectionStatistics, DocNo, PostingIterator, Segment, SegmentView, Term,
};

/// Shard-wide scoring statistics over one snapshot's segments
pub struct ShardStatistics {
    segments: Vec<Arc<Segment>>,
    collection: CollectionStatistics,
    doc_frequencies: RwLock<HashMap<Term, u64>>,
    scorer: Bm25Scorer,
}

impl ShardStatistics {
    pub fn new(views: &[SegmentView], scorer: Bm25Scorer) -> Self {
        let collection = CollectionStatistics::aggregate(views.iter().map(|v| v.segment.stats()));
        Self {
            segments: views.iter().map(|v| v.segment.clone()).collect(),
            collection,
            doc_frequencies: RwLock::new(HashMap::new()),
            scorer,
        }
    }

    /// Documents in the snapshot, deleted ones included
    pub fn total_docs(&self) -> u64 {
        self.collection.total_docs
    }

    /// Shard-wide document frequency of a term
    pub fn doc_frequency(&self, term: &Term) -> u64 {
        if let Some(df) = self.doc_frequencies.read().get(term) {
            return *df;
        }
        let df = self
            .segments
            .iter()
            .map(|s| s.doc_frequency(term) as u64)
            .sum();
        self.doc_frequencies.write().insert(term.clone(), df);
        df
    }

    pub fn avg_field_length(&self, field: &str) -> f32 {
        self.collection.avg_field_length(field)
    }

    pub fn idf(&self, term: &Term) -> f32 {
        self.scorer.idf(self.doc_frequency(term), self.total_docs())
    }

    pub fn scorer(&self) -> &Bm25Scorer {
        &self.scorer
    }
}

/// Context for executing query nodes against one segment of a snapshot
pub struct QueryContext<'a> {
    view: &'a SegmentView,
    stats: &'a ShardStatistics,
    boosts: &'a HashMap<String, f32>,
}

impl<'a> QueryContext<'a> {
    pub fn new(
        view: &'a SegmentView,
        stats: &'a ShardStatistics,
        boosts: &'a HashMap<String, f32>,
    ) -> Self {
        Self { view, stats, boosts }
    }

    pub fn segment(&self) -> &'a Segment {
        &self.view.segment
    }

    /// Live documents as captured by the snapshot
    pub fn live(&self) -> &'a RoaringBitmap {
        &self.view.live
    }

    pub fn stats(&self) -> &'a ShardStatistics {
        self.stats
    }

    /// Per-field score multiplier, 1.0 when the request sets none
    pub fn field_boost(&self, field: &str) -> f32 {
        self.boosts.get(field).copied().unwrap_or(1.0)
    }

    pub fn postings(&self, term: &Term) -> Result<Option<PostingIterator<'a>>> {
        self.view.segment.postings(term)
    }

    pub fn field_length(&self, field: &str, docno: DocNo) -> u32 {
        self.view.segment.stats().field_length(field, docno)
    }

    /// BM25 contribution of `term` occurring `tf` times in `docno`, boost applied
    pub fn term_score(&self, term: &Term, docno: DocNo, tf: u32, idf: f32) -> f32 {
        let avg = self.stats.avg_field_length(&term.field);
        let len = self.field_length(&term.field, docno);
        self.stats.scorer().term_score(tf, len, avg, idf) * self.field_boost(&term.field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerConfig;
    use crate::models::Document;
    use crate::schema::{FieldMapping, IndexMapping};
    use crate::segment::{SegmentBuilder, SegmentId};
    use crate::tokenizer::Tokenizer;

    fn view(id: u64, docs: &[(&str, &str)]) -> SegmentView {
        let mapping = IndexMapping::new().field("body", FieldMapping::text());
        let tokenizer = Tokenizer::new(&TokenizerConfig::default()).unwrap();
        let mut builder = SegmentBuilder::new(SegmentId::new(id), &mapping, &tokenizer);
        for (i, (key, body)) in docs.iter().enumerate() {
            builder
                .add_document(key, i as u64 + 1, &Document::new().with_text("body", *body))
                .unwrap();
        }
        SegmentView::new(Arc::new(builder.finish().unwrap().segment))
    }

    #[test]
    fn test_statistics_span_segments() {
        let a = view(1, &[("1", "cat sat"), ("2", "cat ran")]);
        let b = view(2, &[("3", "dog sat on the mat")]);
        let stats = ShardStatistics::new(&[a, b], Bm25Scorer::default());

        assert_eq!(stats.total_docs(), 3);
        assert_eq!(stats.doc_frequency(&Term::new("body", "cat")), 2);
        assert_eq!(stats.doc_frequency(&Term::new("body", "sat")), 2);
        assert_eq!(stats.doc_frequency(&Term::new("body", "bird")), 0);
        assert!((stats.avg_field_length("body") - 3.0).abs() < 1e-6);
        assert!(stats.idf(&Term::new("body", "dog")) > stats.idf(&Term::new("body", "cat")));
    }

    #[test]
    fn test_field_boost_defaults_to_one() {
        let a = view(1, &[("1", "cat")]);
        let stats = ShardStatistics::new(std::slice::from_ref(&a), Bm25Scorer::default());
        let mut boosts = HashMap::new();
        boosts.insert("title".to_string(), 3.0);
        let ctx = QueryContext::new(&a, &stats, &boosts);
        assert_eq!(ctx.field_boost("title"), 3.0);
        assert_eq!(ctx.field_boost("body"), 1.0);
        assert_eq!(ctx.live().len(), 1);
    }
}
