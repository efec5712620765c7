//! Query model and execution
//!
//! Queries are a typed tree ([`Query`]), serialized with serde:
//!
//! ```json
//! {
//!   "bool": {
//!     "must": [ { "match": { "field": "body", "text": "rust programming" } } ],
//!     "filter": [ { "range": { "field": "price", "gte": 10.0 } } ]
//!   }
//! }
//! ```
//!
//! The planner resolves a `Query` against the index mapping and analyzer
//! into `QueryNode`s; the executor runs them per segment of a shard snapshot
//! and keeps the local top-K; the coordinator merges shards in two phases.

pub mod ast;
pub mod context;
pub mod coordinator;
pub mod executor;
pub mod nodes;
pub mod planner;
pub mod scorer;

use serde::{Deserialize, Serialize};

use crate::models::GeoPoint;

pub use ast::{Matches, QueryNode};
pub use context::{QueryContext, ShardStatistics};
pub use coordinator::QueryCoordinator;
pub use executor::{compare_hits, DocAddress, LocalHit, LocalTopDocs, QueryExecutor};
pub use nodes::Operator;
pub use planner::{QueryPlan, QueryPlanner};
pub use scorer::{Bm25Params, Bm25Scorer};

/// A search query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    /// Every live document, constant score
    MatchAll,
    /// One exact term; analyzed the way the field is indexed
    Term { field: String, value: String },
    /// Analyzed text, terms combined by `operator`
    Match {
        field: String,
        text: String,
        #[serde(default)]
        operator: Operator,
    },
    /// Analyzed text whose terms must appear in order, within `slop`
    Phrase {
        field: String,
        text: String,
        #[serde(default)]
        slop: u32,
    },
    Prefix { field: String, prefix: String },
    /// Inclusive numeric or date range; dates are epoch millis
    Range {
        field: String,
        #[serde(default)]
        gte: Option<f64>,
        #[serde(default)]
        lte: Option<f64>,
    },
    GeoBoundingBox {
        field: String,
        top_left: GeoPoint,
        bottom_right: GeoPoint,
    },
    Bool {
        #[serde(default)]
        must: Vec<Query>,
        #[serde(default)]
        should: Vec<Query>,
        #[serde(default)]
        must_not: Vec<Query>,
        #[serde(default)]
        filter: Vec<Query>,
    },
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Match with the `Or` operator
    pub fn match_text(field: impl Into<String>, text: impl Into<String>) -> Self {
        Query::Match {
            field: field.into(),
            text: text.into(),
            operator: Operator::Or,
        }
    }

    /// Match with the `And` operator
    pub fn match_all_terms(field: impl Into<String>, text: impl Into<String>) -> Self {
        Query::Match {
            field: field.into(),
            text: text.into(),
            operator: Operator::And,
        }
    }

    pub fn phrase(field: impl Into<String>, text: impl Into<String>) -> Self {
        Query::Phrase {
            field: field.into(),
            text: text.into(),
            slop: 0,
        }
    }

    pub fn prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Query::Prefix {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    pub fn range(field: impl Into<String>, gte: Option<f64>, lte: Option<f64>) -> Self {
        Query::Range {
            field: field.into(),
            gte,
            lte,
        }
    }

    /// Empty bool query, to be filled with the `with_*` builders
    pub fn bool() -> Self {
        Query::Bool {
            must: Vec::new(),
            should: Vec::new(),
            must_not: Vec::new(),
            filter: Vec::new(),
        }
    }

    pub fn with_must(self, clause: Query) -> Self {
        self.push_clause(Occur::Must, clause)
    }

    pub fn with_should(self, clause: Query) -> Self {
        self.push_clause(Occur::Should, clause)
    }

    pub fn with_must_not(self, clause: Query) -> Self {
        self.push_clause(Occur::MustNot, clause)
    }

    pub fn with_filter(self, clause: Query) -> Self {
        self.push_clause(Occur::Filter, clause)
    }

    /// Adds a clause to a bool query; any other query is first wrapped as its `must`
    fn push_clause(self, occur: Occur, clause: Query) -> Self {
        let mut query = match self {
            q @ Query::Bool { .. } => q,
            other => Query::bool().with_must(other),
        };
        if let Query::Bool {
            must,
            should,
            must_not,
            filter,
        } = &mut query
        {
            match occur {
                Occur::Must => must.push(clause),
                Occur::Should => should.push(clause),
                Occur::MustNot => must_not.push(clause),
                Occur::Filter => filter.push(clause),
            }
        }
        query
    }
}

#[derive(Clone, Copy)]
enum Occur {
    Must,
    Should,
    MustNot,
    Filter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_json_shape() {
        let json = r#"{"bool": {"must": [{"match": {"field": "body", "text": "rust"}}],
                       "filter": [{"range": {"field": "price", "gte": 10.0}}]}}"#;
        let query: Query = serde_json::from_str(json).unwrap();
        assert_eq!(
            query,
            Query::bool()
                .with_must(Query::match_text("body", "rust"))
                .with_filter(Query::range("price", Some(10.0), None))
        );

        let all: Query = serde_json::from_str(r#""match_all""#).unwrap();
        assert_eq!(all, Query::MatchAll);
    }

    #[test]
    fn test_builders_wrap_non_bool() {
        let q = Query::term("tag", "a").with_must_not(Query::term("tag", "b"));
        match q {
            Query::Bool { must, must_not, .. } => {
                assert_eq!(must, vec![Query::term("tag", "a")]);
                assert_eq!(must_not, vec![Query::term("tag", "b")]);
            }
            other => panic!("expected bool, got {:?}", other),
        }
    }
}
