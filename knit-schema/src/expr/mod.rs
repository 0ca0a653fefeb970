//! Relation expressions: which relations to load or write, and how deep.
//!
//! Expressions come in two notations, a string form parsed by a pest grammar
//! and an object form read from JSON. Both produce the same
//! [`RelationExpression`] tree, and [`Display`](std::fmt::Display) renders the
//! canonical string form back.

mod cache;
mod grammar;
mod node;
mod object;
mod parser;

use std::sync::Arc;

pub use cache::{CacheStats, ExpressionCache, global_cache, parse_cached};
pub use grammar::{RelationExprParser, Rule};
pub use node::{ModifierCall, Recursion, RelationExpression};
pub use parser::parse_expression;

use crate::error::SchemaResult;

/// Types that can be turned into a shared relation expression.
///
/// String slices go through the global parse cache.
pub trait IntoRelationExpression {
    /// Convert into a shared expression.
    fn into_relation_expression(self) -> SchemaResult<Arc<RelationExpression>>;
}

impl IntoRelationExpression for &str {
    fn into_relation_expression(self) -> SchemaResult<Arc<RelationExpression>> {
        parse_cached(self)
    }
}

impl IntoRelationExpression for &String {
    fn into_relation_expression(self) -> SchemaResult<Arc<RelationExpression>> {
        parse_cached(self)
    }
}

impl IntoRelationExpression for String {
    fn into_relation_expression(self) -> SchemaResult<Arc<RelationExpression>> {
        parse_cached(&self)
    }
}

impl IntoRelationExpression for RelationExpression {
    fn into_relation_expression(self) -> SchemaResult<Arc<RelationExpression>> {
        Ok(Arc::new(self))
    }
}

impl IntoRelationExpression for &RelationExpression {
    fn into_relation_expression(self) -> SchemaResult<Arc<RelationExpression>> {
        Ok(Arc::new(self.clone()))
    }
}

impl IntoRelationExpression for Arc<RelationExpression> {
    fn into_relation_expression(self) -> SchemaResult<Arc<RelationExpression>> {
        Ok(self)
    }
}

impl IntoRelationExpression for &serde_json::Value {
    fn into_relation_expression(self) -> SchemaResult<Arc<RelationExpression>> {
        match self {
            serde_json::Value::String(s) => parse_cached(s),
            other => RelationExpression::from_object(other).map(Arc::new),
        }
    }
}
