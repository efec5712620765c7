//! Range queries over the block KD-tree
//!
//! Numeric and date fields are 1-D trees, geo points 2-D. Both queries are
//! filters: matching documents score the field boost.

use roaring::RoaringBitmap;

use crate::models::GeoPoint;
use crate::query::ast::{Matches, QueryNode};
use crate::query::context::QueryContext;
use crate::segment::RangeQueryIter;
use crate::Result;

fn collect(blocks: Option<RangeQueryIter<'_>>) -> RoaringBitmap {
    let mut docs = RoaringBitmap::new();
    for block in blocks.into_iter().flatten() {
        docs.extend(block.into_iter().map(|d| d.0));
    }
    docs
}

/// Documents whose numeric or date value lies in `[gte, lte]`; an open bound is unbounded
#[derive(Clone, Debug)]
pub struct RangeQuery {
    pub field: String,
    pub gte: Option<f64>,
    pub lte: Option<f64>,
}

impl RangeQuery {
    pub fn new(field: impl Into<String>, gte: Option<f64>, lte: Option<f64>) -> Self {
        Self {
            field: field.into(),
            gte,
            lte,
        }
    }
}

impl QueryNode for RangeQuery {
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        let blocks = ctx
            .segment()
            .ranges()
            .tree(&self.field)
            .map(|tree| tree.numeric_range(self.gte, self.lte));
        Ok(Matches::constant(collect(blocks), ctx.field_boost(&self.field)))
    }

    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64 {
        ctx.segment()
            .ranges()
            .tree(&self.field)
            .map_or(0, |tree| tree.len() as u64)
    }

    fn query_type(&self) -> &'static str {
        "range"
    }

    fn is_scoring(&self) -> bool {
        false
    }

    fn clone_box(&self) -> Box<dyn QueryNode> {
        Box::new(self.clone())
    }
}

/// Documents with a geo point inside the box spanned by two corners
#[derive(Clone, Debug)]
pub struct GeoBoundingBoxQuery {
    pub field: String,
    pub top_left: GeoPoint,
    pub bottom_right: GeoPoint,
}

impl QueryNode for GeoBoundingBoxQuery {
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        let blocks = ctx
            .segment()
            .ranges()
            .tree(&self.field)
            .map(|tree| tree.geo_box(&self.top_left, &self.bottom_right));
        Ok(Matches::constant(collect(blocks), ctx.field_boost(&self.field)))
    }

    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64 {
        ctx.segment()
            .ranges()
            .tree(&self.field)
            .map_or(0, |tree| tree.len() as u64)
    }

    fn query_type(&self) -> &'static str {
        "geo_bounding_box"
    }

    fn is_scoring(&self) -> bool {
        false
    }

    fn clone_box(&self) -> Box<dyn QueryNode> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::nodes::test_support::Fixture;

    #[test]
    fn test_numeric_range_bounds_are_inclusive() {
        // price is the document's index: 0.0, 1.0, 2.0, 3.0
        let fx = Fixture::new(&[("a", "x"), ("b", "x"), ("c", "x"), ("d", "x")]);
        let ctx = fx.context(0);

        let m = RangeQuery::new("price", Some(1.0), Some(2.0)).execute(&ctx).unwrap();
        assert_eq!(fx.keys(&m), vec!["b", "c"]);

        let open = RangeQuery::new("price", Some(2.5), None).execute(&ctx).unwrap();
        assert_eq!(fx.keys(&open), vec!["d"]);

        let missing = RangeQuery::new("nope", None, None).execute(&ctx).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_geo_box() {
        // loc is (index, index)
        let fx = Fixture::new(&[("a", "x"), ("b", "x"), ("c", "x")]);
        let ctx = fx.context(0);
        let q = GeoBoundingBoxQuery {
            field: "loc".to_string(),
            top_left: GeoPoint::new(1.5, -1.0),
            bottom_right: GeoPoint::new(-0.5, 1.5),
        };
        let m = q.execute(&ctx).unwrap();
        assert_eq!(fx.keys(&m), vec!["a", "b"]);
    }
}
