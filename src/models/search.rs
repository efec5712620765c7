use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use super::document::{DocKey, Document, FieldValue};
use super::operation::ShardId;
use crate::query::Query;

/// Sort direction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Sort by a columnar field instead of by score
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// A value read from the columnar store for sorting
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SortValue {
    Long(i64),
    Double(f64),
    Keyword(String),
    Missing,
}

impl SortValue {
    pub fn from_field(value: Option<FieldValue>) -> Self {
        match value {
            Some(FieldValue::Long(v)) | Some(FieldValue::Date(v)) => SortValue::Long(v),
            Some(FieldValue::Double(v)) => SortValue::Double(v),
            Some(FieldValue::Keyword(s)) | Some(FieldValue::Text(s)) => SortValue::Keyword(s),
            Some(FieldValue::GeoPoint(_)) | None => SortValue::Missing,
        }
    }

    /// Compare under the given order; missing values always sort last
    pub fn compare(&self, other: &SortValue, order: SortOrder) -> Ordering {
        let natural = match (self, other) {
            (SortValue::Missing, SortValue::Missing) => return Ordering::Equal,
            (SortValue::Missing, _) => return Ordering::Greater,
            (_, SortValue::Missing) => return Ordering::Less,
            (SortValue::Long(a), SortValue::Long(b)) => a.cmp(b),
            (SortValue::Keyword(a), SortValue::Keyword(b)) => a.cmp(b),
            (SortValue::Keyword(_), _) => Ordering::Greater,
            (_, SortValue::Keyword(_)) => Ordering::Less,
            (a, b) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
        };
        match order {
            SortOrder::Asc => natural,
            SortOrder::Desc => natural.reverse(),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            SortValue::Long(v) => *v as f64,
            SortValue::Double(v) => *v,
            _ => f64::NAN,
        }
    }
}

/// Search request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Query,
    #[serde(default)]
    pub from: usize,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    /// Per-field score multipliers
    #[serde(default)]
    pub boosts: HashMap<String, f32>,
    /// Per-shard deadline; falls back to the index setting
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Whether phase 2 fetches stored documents
    #[serde(default = "default_true")]
    pub fetch_documents: bool,
}

fn default_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl SearchRequest {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            from: 0,
            size: default_size(),
            sort: None,
            boosts: HashMap::new(),
            timeout: None,
            fetch_documents: true,
        }
    }

    pub fn with_from(mut self, from: usize) -> Self {
        self.from = from;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_boost(mut self, field: impl Into<String>, boost: f32) -> Self {
        self.boosts.insert(field.into(), boost);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_documents(mut self) -> Self {
        self.fetch_documents = false;
        self
    }

    /// Number of hits each shard must return so the global window is exact
    pub fn shard_window(&self) -> usize {
        self.from.saturating_add(self.size)
    }
}

/// One ranked hit
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: DocKey,
    pub score: f32,
    pub shard: ShardId,
    #[serde(default)]
    pub sort_value: Option<SortValue>,
    pub document: Option<Document>,
}

/// A shard that did not contribute to a response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardFailure {
    pub shard: ShardId,
    pub reason: String,
}

/// Search response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Sum of per-shard match counts; approximate under concurrent mutation
    pub total_approx: u64,
    pub partial: bool,
    pub failed_shards: Vec<ShardFailure>,
    pub took_ms: u64,
}

impl SearchResponse {
    pub fn keys(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.key.as_str()).collect()
    }
}

/// Index health
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every copy of every shard is available and in sync
    Green,
    /// All shards serve, some replicas are stale or unreachable
    Yellow,
    /// At least one shard has no available intact copy
    Red,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_request_defaults() {
        let req = SearchRequest::new(Query::MatchAll).with_from(5);
        assert_eq!(req.size, 10);
        assert_eq!(req.shard_window(), 15);
        assert!(req.fetch_documents);

        let huge = SearchRequest::new(Query::MatchAll)
            .with_from(usize::MAX)
            .with_size(10);
        assert_eq!(huge.shard_window(), usize::MAX);
    }

    #[test]
    fn test_sort_value_ordering() {
        let a = SortValue::Long(1);
        let b = SortValue::Double(2.5);
        assert_eq!(a.compare(&b, SortOrder::Asc), Ordering::Less);
        assert_eq!(a.compare(&b, SortOrder::Desc), Ordering::Greater);

        // Missing sorts last in both directions
        assert_eq!(SortValue::Missing.compare(&a, SortOrder::Asc), Ordering::Greater);
        assert_eq!(SortValue::Missing.compare(&a, SortOrder::Desc), Ordering::Greater);
    }

    #[test]
    fn test_health_ordering() {
        assert!(HealthStatus::Red > HealthStatus::Yellow);
        assert!(HealthStatus::Yellow > HealthStatus::Green);
    }
}
