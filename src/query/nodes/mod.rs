//! Concrete query node implementations

mod all_docs;
mod bool_query;
mod match_query;
mod phrase_query;
mod prefix_query;
mod range_query;
mod term_query;

pub use all_docs::AllDocsQuery;
pub use bool_query::BoolQuery;
pub use match_query::{MatchQuery, Operator};
pub use phrase_query::PhraseQuery;
pub use prefix_query::PrefixQuery;
pub use range_query::{GeoBoundingBoxQuery, RangeQuery};
pub use term_query::TermQuery;

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::config::TokenizerConfig;
    use crate::models::Document;
    use crate::query::ast::Matches;
    use crate::query::context::{QueryContext, ShardStatistics};
    use crate::query::scorer::Bm25Scorer;
    use crate::schema::{FieldMapping, IndexMapping};
    use crate::segment::{DocNo, Segment, SegmentBuilder, SegmentId, SegmentView};
    use crate::tokenizer::Tokenizer;

    pub fn mapping() -> IndexMapping {
        IndexMapping::new()
            .field("body", FieldMapping::text())
            .field("tag", FieldMapping::keyword())
            .field("price", FieldMapping::double())
            .field("loc", FieldMapping::geo_point())
    }

    /// One segment per slice. Document `i` of a segment has `body` text,
    /// `tag` = key, `price` = i and `loc` = (i, i).
    pub fn build_segment(id: u64, docs: &[(&str, &str)]) -> Arc<Segment> {
        let mapping = mapping();
        let tokenizer = Tokenizer::new(&TokenizerConfig::default()).unwrap();
        let mut builder = SegmentBuilder::new(SegmentId::new(id), &mapping, &tokenizer);
        for (i, (key, body)) in docs.iter().enumerate() {
            let doc = Document::new()
                .with_text("body", *body)
                .with_keyword("tag", *key)
                .with_double("price", i as f64)
                .with_geo("loc", i as f64, i as f64);
            builder.add_document(key, id * 1000 + i as u64, &doc).unwrap();
        }
        Arc::new(builder.finish().unwrap().segment)
    }

    pub struct Fixture {
        pub views: Vec<SegmentView>,
        pub stats: ShardStatistics,
        pub boosts: HashMap<String, f32>,
    }

    impl Fixture {
        pub fn new(docs: &[(&str, &str)]) -> Self {
            Self::with_segments(&[docs])
        }

        pub fn with_segments(segments: &[&[(&str, &str)]]) -> Self {
            let segments = segments
                .iter()
                .enumerate()
                .map(|(i, docs)| build_segment(i as u64 + 1, docs))
                .collect();
            Self::from_segments(segments)
        }

        pub fn from_segments(segments: Vec<Arc<Segment>>) -> Self {
            let views: Vec<SegmentView> = segments.into_iter().map(SegmentView::new).collect();
            let stats = ShardStatistics::new(&views, Bm25Scorer::default());
            Self {
                views,
                stats,
                boosts: HashMap::new(),
            }
        }

        /// Same segments with freshly captured live bitsets
        pub fn recaptured(&self) -> Self {
            Self::from_segments(self.views.iter().map(|v| v.segment.clone()).collect())
        }

        pub fn with_boost(mut self, field: &str, boost: f32) -> Self {
            self.boosts.insert(field.to_string(), boost);
            self
        }

        pub fn context(&self, segment: usize) -> QueryContext<'_> {
            QueryContext::new(&self.views[segment], &self.stats, &self.boosts)
        }

        /// Keys of the matches in the first segment, in docno order
        pub fn keys(&self, matches: &Matches) -> Vec<String> {
            matches
                .docs
                .iter()
                .filter_map(|d| self.views[0].segment.key(DocNo(d)).map(str::to_string))
                .collect()
        }
    }
}
