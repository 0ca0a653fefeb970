//! Pest grammar for relation expressions.

use pest_derive::Parser;

/// The relation expression parser.
#[derive(Parser)]
#[grammar = "expr/relation_expr.pest"]
pub struct RelationExprParser;
