//! All documents query - matches every live document

use crate::query::ast::{Matches, QueryNode};
use crate::query::context::QueryContext;
use crate::Result;

/// Query that matches all live documents with a constant score
#[derive(Clone, Debug, Default)]
pub struct AllDocsQuery;

impl AllDocsQuery {
    pub fn new() -> Self {
        Self
    }
}

impl QueryNode for AllDocsQuery {
    fn execute(&self, ctx: &QueryContext<'_>) -> Result<Matches> {
        Ok(Matches::constant(ctx.live().clone(), 1.0))
    }

    fn estimate_cost(&self, ctx: &QueryContext<'_>) -> u64 {
        ctx.live().len()
    }

    fn query_type(&self) -> &'static str {
        "all_docs"
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
    use crate::segment::DocNo;

    #[test]
    fn test_all_docs_skips_deleted() {
        let fx = Fixture::new(&[("1", "a"), ("2", "b"), ("3", "c")]);
        fx.views[0].segment.delete(DocNo(1));
        // The fixture's view was captured before the delete
        assert_eq!(AllDocsQuery::new().execute(&fx.context(0)).unwrap().len(), 3);

        let fresh = fx.recaptured();
        let m = AllDocsQuery::new().execute(&fresh.context(0)).unwrap();
        assert_eq!(fresh.keys(&m), vec!["1", "3"]);
    }
}
