//! Prefix query - matches terms starting with a prefix
//!
//! Expansion is a range scan over the FST term dictionary; every matching
//! document gets the same score.

use roaring::RoaringBitmap;

use crate::query::ast::{Matches, QueryNode};
use crate::query::context::QueryContext;
use crate::Result;

/// Query that matches documents with any term of `field` starting with `prefix`
#[derive(Clone, Debug)]
pub struct PrefixQuery {
    pub field: String,
    /// Already analyzed prefix
    pub prefix: String,
}

impl PrefixQuery {
    pub fn new(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            prefix: prefix.into(),
        }
    }
}

impl QueryNode for PrefixQuery {
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        let segment = ctx.segment();
        let mut docs = RoaringBitmap::new();
        for (_, meta) in segment.prefix_terms(&self.field, &self.prefix) {
            for (docno, _) in segment.postings_for(meta)? {
                docs.insert(docno.0);
            }
        }
        Ok(Matches::constant(docs, ctx.field_boost(&self.field)))
    }

    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64 {
        ctx.segment()
            .prefix_terms(&self.field, &self.prefix)
            .iter()
            .map(|(_, meta)| meta.doc_frequency as u64)
            .sum()
    }

    fn query_type(&self) -> &'static str {
        "prefix"
    }

    fn is_scoring(&self) -> bool {
        false
    }

    fn clone_box(&self) -> Box<dyn QueryNode> {
        Box::new(self.clone())
    }
}
