//! String form of relation expressions.

use pest::Parser;
use pest::error::{ErrorVariant, InputLocation};
use pest::iterators::Pair;

use super::grammar::{RelationExprParser, Rule};
use super::node::{ModifierCall, Recursion, RelationExpression};
use crate::error::{SchemaError, SchemaResult};

/// Parse a relation expression.
///
/// ```rust
/// use knit_schema::expr::{parse_expression, Recursion};
///
/// let expr = parse_expression("[children.^2, dogs:pets(onlyDogs)]").unwrap();
/// assert_eq!(expr.child("children").unwrap().recursion(), Some(Recursion::Depth(2)));
/// assert_eq!(expr.child("dogs").unwrap().relation_name(), Some("pets"));
/// ```
pub fn parse_expression(input: &str) -> SchemaResult<RelationExpression> {
    let pairs =
        RelationExprParser::parse(Rule::expression, input).map_err(|e| syntax_error(input, e))?;

    let mut root = RelationExpression::root();
    for expression in pairs {
        for pair in expression.into_inner() {
            match pair.as_rule() {
                Rule::child_list => parse_child_list(input, pair, &mut root)?,
                Rule::node => root.add_child(parse_node(input, pair)?)?,
                _ => {}
            }
        }
    }

    tracing::trace!(expression = input, "parsed relation expression");
    Ok(root)
}

fn parse_node(input: &str, pair: Pair<'_, Rule>) -> SchemaResult<RelationExpression> {
    let mut expr = RelationExpression::root();
    let mut prefix_alias = None;
    let mut aliased = false;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::alias_prefix => {
                prefix_alias = part.into_inner().next().map(|p| p.as_str().to_string());
                aliased = prefix_alias.is_some();
            }
            Rule::identifier => {
                expr = RelationExpression::relation(part.as_str());
                if let Some(alias) = prefix_alias.take() {
                    expr = expr.with_alias(alias);
                }
            }
            Rule::modifier_list => {
                for modifier in part.into_inner() {
                    expr.push_modifier(ModifierCall::new(modifier.as_str()));
                }
            }
            Rule::as_suffix => {
                let offset = part.as_span().start();
                if aliased {
                    return Err(SchemaError::syntax(
                        input,
                        offset,
                        "relation is aliased twice",
                    ));
                }
                if let Some(alias) = part.into_inner().find(|p| p.as_rule() == Rule::identifier) {
                    expr = expr.with_alias(alias.as_str());
                }
            }
            Rule::recursion => expr.set_recursion(Some(parse_recursion(input, part)?)),
            Rule::child_list => parse_child_list(input, part, &mut expr)?,
            Rule::node => expr.add_child(parse_node(input, part)?)?,
            _ => {}
        }
    }

    Ok(expr)
}

fn parse_child_list(
    input: &str,
    pair: Pair<'_, Rule>,
    parent: &mut RelationExpression,
) -> SchemaResult<()> {
    for child in pair.into_inner() {
        if child.as_rule() == Rule::node {
            parent.add_child(parse_node(input, child)?)?;
        }
    }
    Ok(())
}

fn parse_recursion(input: &str, pair: Pair<'_, Rule>) -> SchemaResult<Recursion> {
    let Some(depth) = pair.into_inner().next() else {
        return Ok(Recursion::Infinite);
    };
    let offset = depth.as_span().start();
    match depth.as_str().parse::<u32>() {
        Ok(0) => Err(SchemaError::syntax(
            input,
            offset,
            "recursion depth must be at least 1",
        )),
        Ok(n) => Ok(Recursion::Depth(n)),
        Err(_) => Err(SchemaError::syntax(input, offset, "recursion depth is too large")),
    }
}

fn syntax_error(input: &str, err: pest::error::Error<Rule>) -> SchemaError {
    let offset = match err.location {
        InputLocation::Pos(pos) => pos,
        InputLocation::Span((start, _)) => start,
    };
    let message = match &err.variant {
        ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
            let mut expected: Vec<&str> = positives.iter().map(describe).collect();
            expected.dedup();
            format!("expected {}", expected.join(" or "))
        }
        ErrorVariant::ParsingError { .. } => "unexpected input".to_string(),
        ErrorVariant::CustomError { message } => message.clone(),
    };
    SchemaError::syntax(input, offset, message)
}

fn describe(rule: &Rule) -> &'static str {
    match rule {
        Rule::identifier | Rule::node | Rule::alias_prefix => "relation name",
        Rule::child_list => "`[`",
        Rule::recursion => "`^`",
        Rule::depth => "recursion depth",
        Rule::modifier_list => "`(`",
        Rule::as_suffix | Rule::as_keyword => "`as`",
        Rule::EOI => "end of input",
        _ => "token",
    }
}
