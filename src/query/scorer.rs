//! BM25 relevance scoring
//!
//! Score = IDF * (TF * (k1 + 1)) / (TF + k1 * (1 - b + b * (dl / avgdl)))
//! with IDF = ln(1 + (N - df + 0.5) / (df + 0.5)), summed over query terms.

use serde::{Deserialize, Serialize};

/// BM25 tuning parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term frequency saturation
    pub k1: f32,
    /// Length normalization strength, 0 disables it
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Scores term matches against shard-wide statistics
#[derive(Clone, Copy, Debug, Default)]
pub struct Bm25Scorer {
    params: Bm25Params,
}

impl Bm25Scorer {
    pub fn new(params: Bm25Params) -> Self {
        Self { params }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Inverse document frequency; rarer terms weigh more
    pub fn idf(&self, doc_frequency: u64, total_docs: u64) -> f32 {
        let n = total_docs as f32;
        let df = (doc_frequency as f32).min(n);
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Contribution of one term to one document.
    ///
    /// `avg_length` of zero (no document has the field) disables length normalization.
    pub fn term_score(
        &self,
        term_frequency: u32,
        doc_length: u32,
        avg_length: f32,
        idf: f32,
    ) -> f32 {
        if term_frequency == 0 {
            return 0.0;
        }
        let Bm25Params { k1, b } = self.params;
        let tf = term_frequency as f32;
        let norm = if avg_length > 0.0 {
            1.0 - b + b * (doc_length as f32 / avg_length)
        } else {
            1.0
        };
        idf * (tf * (k1 + 1.0)) / (tf + k1 * norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idf_grows_with_rarity() {
        let scorer = Bm25Scorer::default();
        let rare = scorer.idf(1, 1000);
        let common = scorer.idf(900, 1000);
        assert!(rare > common);
        assert!(common > 0.0);
    }

    #[test]
    fn test_tf_saturates() {
        let scorer = Bm25Scorer::default();
        let idf = scorer.idf(10, 100);
        let s1 = scorer.term_score(1, 10, 10.0, idf);
        let s2 = scorer.term_score(2, 10, 10.0, idf);
        let s20 = scorer.term_score(20, 10, 10.0, idf);
        let s40 = scorer.term_score(40, 10, 10.0, idf);

        assert!(s2 > s1);
        // Doubling tf adds less and less
        assert!(s2 - s1 > s40 - s20);
        // Bounded by idf * (k1 + 1)
        assert!(s40 < idf * 2.2);
    }

    #[test]
    fn test_long_documents_are_discounted() {
        let scorer = Bm25Scorer::default();
        let idf = scorer.idf(10, 100);
        let short = scorer.term_score(1, 5, 10.0, idf);
        let long = scorer.term_score(1, 50, 10.0, idf);
        assert!(short > long);

        let flat = Bm25Scorer::new(Bm25Params { k1: 1.2, b: 0.0 });
        assert_eq!(flat.term_score(1, 5, 10.0, idf), flat.term_score(1, 50, 10.0, idf));
    }

    #[test]
    fn test_zero_tf_scores_nothing() {
        let scorer = Bm25Scorer::default();
        assert_eq!(scorer.term_score(0, 5, 5.0, 3.0), 0.0);
    }
}
