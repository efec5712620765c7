//! Query planner
//!
//! Resolves a [`Query`] against the index mapping: text is analyzed with the
//! index tokenizer, keyword values stay exact, term lookups on numeric and
//! date fields become single-point ranges. Queries on unmapped fields match
//! nothing; queries that cannot apply to a field's type are rejected.

use crate::error::{Result, ShoalError};
use crate::query::ast::{MatchNoneQuery, QueryNode};
use crate::query::nodes::{
    AllDocsQuery, BoolQuery, GeoBoundingBoxQuery, MatchQuery, PhraseQuery, PrefixQuery,
    RangeQuery, TermQuery,
};
use crate::query::Query;
use crate::schema::{parse_date, FieldType, IndexMapping};
use crate::segment::Term;
use crate::tokenizer::Tokenizer;

/// Query execution plan
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub root: Box<dyn QueryNode>,
    /// Whether any node contributes to relevance
    pub uses_scoring: bool,
}

/// Turns queries into executable node trees
pub struct QueryPlanner<'a> {
    mapping: &'a IndexMapping,
    tokenizer: &'a Tokenizer,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(mapping: &'a IndexMapping, tokenizer: &'a Tokenizer) -> Self {
        Self { mapping, tokenizer }
    }

    pub fn plan(&self, query: &Query) -> Result<QueryPlan> {
        let root = self.node(query)?;
        let uses_scoring = root.is_scoring();
        Ok(QueryPlan { root, uses_scoring })
    }

    fn node(&self, query: &Query) -> Result<Box<dyn QueryNode>> {
        match query {
            Query::MatchAll => Ok(Box::new(AllDocsQuery::new())),
            Query::Term { field, value } => self.exact(field, value),
            Query::Match {
                field,
                text,
                operator,
            } => match self.mapping.field_type(field) {
                None => Ok(Box::new(MatchNoneQuery)),
                Some(FieldType::Text { .. }) => {
                    let terms = self
                        .tokenizer
                        .tokenize(text)
                        .into_iter()
                        .map(|token| Term::new(field.as_str(), token))
                        .collect();
                    Ok(Box::new(MatchQuery::new(terms, *operator)))
                }
                Some(_) => self.exact(field, text),
            },
            Query::Phrase { field, text, slop } => match self.mapping.field_type(field) {
                None => Ok(Box::new(MatchNoneQuery)),
                Some(FieldType::Text { index_positions: true }) => {
                    let tokens = self.tokenizer.tokenize_with_positions_ordered(text);
                    let Some(first) = tokens.first().map(|(_, p)| *p) else {
                        return Ok(Box::new(MatchNoneQuery));
                    };
                    let terms = tokens
                        .into_iter()
                        .map(|(token, pos)| (Term::new(field.as_str(), token), pos - first))
                        .collect();
                    Ok(Box::new(PhraseQuery::new(terms, *slop)))
                }
                Some(FieldType::Keyword { .. }) => self.exact(field, text),
                Some(other) => Err(invalid(field, "phrase", other)),
            },
            Query::Prefix { field, prefix } => match self.mapping.field_type(field) {
                None => Ok(Box::new(MatchNoneQuery)),
                Some(FieldType::Text { .. }) => {
                    Ok(Box::new(PrefixQuery::new(field.as_str(), prefix.to_lowercase())))
                }
                Some(FieldType::Keyword { .. }) => {
                    Ok(Box::new(PrefixQuery::new(field.as_str(), prefix.as_str())))
                }
                Some(other) => Err(invalid(field, "prefix", other)),
            },
            Query::Range { field, gte, lte } => match self.mapping.field_type(field) {
                None => Ok(Box::new(MatchNoneQuery)),
                Some(FieldType::Long | FieldType::Double | FieldType::Date) => {
                    Ok(Box::new(RangeQuery::new(field.as_str(), *gte, *lte)))
                }
                Some(other) => Err(invalid(field, "range", other)),
            },
            Query::GeoBoundingBox {
                field,
                top_left,
                bottom_right,
            } => match self.mapping.field_type(field) {
                None => Ok(Box::new(MatchNoneQuery)),
                Some(FieldType::GeoPoint) => {
                    if !top_left.is_valid() || !bottom_right.is_valid() {
                        return Err(ShoalError::InvalidQuery(format!(
                            "geo_bounding_box on '{}' has an out of range corner",
                            field
                        )));
                    }
                    Ok(Box::new(GeoBoundingBoxQuery {
                        field: field.clone(),
                        top_left: *top_left,
                        bottom_right: *bottom_right,
                    }))
                }
                Some(other) => Err(invalid(field, "geo_bounding_box", other)),
            },
            Query::Bool {
                must,
                should,
                must_not,
                filter,
            } => {
                let mut node = BoolQuery::new();
                for q in must {
                    node.must.push(self.node(q)?);
                }
                for q in should {
                    node.should.push(self.node(q)?);
                }
                for q in must_not {
                    node.must_not.push(self.node(q)?);
                }
                for q in filter {
                    node.filter.push(self.node(q)?);
                }
                Ok(Box::new(node))
            }
        }
    }

    /// A single value matched the way the field indexes it
    fn exact(&self, field: &str, value: &str) -> Result<Box<dyn QueryNode>> {
        match self.mapping.field_type(field) {
            None => Ok(Box::new(MatchNoneQuery)),
            Some(FieldType::Text { .. }) => match self.tokenizer.normalize_term(value) {
                Some(token) => Ok(Box::new(TermQuery::new(field, token))),
                None => Ok(Box::new(MatchNoneQuery)),
            },
            Some(FieldType::Keyword { .. }) => Ok(Box::new(TermQuery::new(field, value))),
            Some(FieldType::Long | FieldType::Double) => {
                let v = value.trim().parse::<f64>().map_err(|_| {
                    ShoalError::InvalidQuery(format!(
                        "'{}' is not a number for field '{}'",
                        value, field
                    ))
                })?;
                Ok(Box::new(RangeQuery::new(field, Some(v), Some(v))))
            }
            Some(FieldType::Date) => {
                let millis = parse_date(value)
                    .or_else(|| value.trim().parse::<i64>().ok())
                    .ok_or_else(|| {
                        ShoalError::InvalidQuery(format!(
                            "'{}' is not a date for field '{}'",
                            value, field
                        ))
                    })?;
                let v = millis as f64;
                Ok(Box::new(RangeQuery::new(field, Some(v), Some(v))))
            }
            Some(other) => Err(invalid(field, "term", other)),
        }
    }
}

fn invalid(field: &str, query: &str, field_type: &FieldType) -> ShoalError {
    ShoalError::InvalidQuery(format!(
        "{} query is not supported on {} field '{}'",
        query,
        field_type.name(),
        field
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerConfig;
    use crate::models::GeoPoint;
    use crate::schema::FieldMapping;

    fn plan(query: &Query) -> Result<QueryPlan> {
        let mapping = IndexMapping::new()
            .field("body", FieldMapping::text())
            .field("tag", FieldMapping::keyword())
            .field("year", FieldMapping::long())
            .field("at", FieldMapping::date())
            .field("loc", FieldMapping::geo_point())
            .field(
                "raw",
                FieldMapping::new(FieldType::Text {
                    index_positions: false,
                }),
            );
        let tokenizer = Tokenizer::new(&TokenizerConfig::default()).unwrap();
        QueryPlanner::new(&mapping, &tokenizer).plan(query)
    }

    #[test]
    fn test_plans_by_field_type() {
        assert_eq!(plan(&Query::match_text("body", "Rust")).unwrap().root.query_type(), "match");
        assert_eq!(plan(&Query::match_text("tag", "Rust")).unwrap().root.query_type(), "term");
        assert_eq!(plan(&Query::term("year", "2024")).unwrap().root.query_type(), "range");
        assert_eq!(plan(&Query::term("at", "2024-01-01")).unwrap().root.query_type(), "range");
        assert_eq!(plan(&Query::phrase("body", "a b")).unwrap().root.query_type(), "phrase");
        assert_eq!(plan(&Query::MatchAll).unwrap().root.query_type(), "all_docs");
    }

    #[test]
    fn test_unmapped_fields_match_nothing() {
        let plan = plan(&Query::match_text("missing", "x")).unwrap();
        assert_eq!(plan.root.query_type(), "match_none");
        assert!(!plan.uses_scoring);
    }

    #[test]
    fn test_rejects_mismatched_queries() {
        assert!(matches!(
            plan(&Query::range("body", Some(1.0), None)),
            Err(ShoalError::InvalidQuery(_))
        ));
        assert!(plan(&Query::term("year", "abc")).is_err());
        assert!(plan(&Query::phrase("raw", "a b")).is_err());
        assert!(plan(&Query::GeoBoundingBox {
            field: "loc".to_string(),
            top_left: GeoPoint::new(95.0, 0.0),
            bottom_right: GeoPoint::new(0.0, 1.0),
        })
        .is_err());
    }

    #[test]
    fn test_bool_scoring_flag() {
        let filter_only = Query::bool().with_filter(Query::range("year", Some(2000.0), None));
        assert!(!plan(&filter_only).unwrap().uses_scoring);

        let scoring = filter_only.with_must(Query::match_text("body", "rust"));
        assert!(plan(&scoring).unwrap().uses_scoring);
    }
}
