//! Object notation for relation expressions.
//!
//! ```json
//! {
//!   "children": {
//!     "$recursive": 2,
//!     "dogs": { "$relation": "pets", "$modify": ["onlyDogs"] },
//!     "movies": { "actors": true }
//!   }
//! }
//! ```

use serde_json::{Map, Value};

use super::node::{ModifierCall, Recursion, RelationExpression};
use super::parser::parse_expression;
use crate::error::{SchemaError, SchemaResult};

const RELATION_KEY: &str = "$relation";
const RECURSIVE_KEY: &str = "$recursive";
const MODIFY_KEY: &str = "$modify";

impl RelationExpression {
    /// Build an expression from object notation.
    ///
    /// A JSON string is parsed as the string form, so both notations can be
    /// accepted from the same input.
    pub fn from_object(value: &Value) -> SchemaResult<Self> {
        match value {
            Value::String(s) => parse_expression(s),
            Value::Object(map) => {
                if let Some(key) = map.keys().find(|k| k.starts_with('$')) {
                    return Err(SchemaError::invalid_expression(format!(
                        "`{key}` is not allowed at the top level"
                    )));
                }
                let mut root = RelationExpression::root();
                add_children(&mut root, map)?;
                Ok(root)
            }
            other => Err(SchemaError::invalid_expression(format!(
                "expected an object, found {}",
                kind_of(other)
            ))),
        }
    }

    /// Object notation of this expression.
    pub fn to_object(&self) -> Value {
        let mut map = Map::new();
        if !self.is_root() {
            let name = self.relation_name().unwrap_or_default();
            if name != self.alias() {
                map.insert(RELATION_KEY.into(), Value::String(name.to_string()));
            }
            match self.recursion() {
                Some(Recursion::Infinite) => {
                    map.insert(RECURSIVE_KEY.into(), Value::Bool(true));
                }
                Some(Recursion::Depth(n)) => {
                    map.insert(RECURSIVE_KEY.into(), Value::from(n));
                }
                None => {}
            }
            if !self.modifiers().is_empty() {
                let modifiers = self
                    .modifiers()
                    .iter()
                    .map(|m| Value::String(m.name.to_string()))
                    .collect();
                map.insert(MODIFY_KEY.into(), Value::Array(modifiers));
            }
            if map.is_empty() && self.children().next().is_none() {
                return Value::Bool(true);
            }
        }
        for child in self.children() {
            map.insert(child.alias().to_string(), child.to_object());
        }
        Value::Object(map)
    }
}

fn add_children(parent: &mut RelationExpression, map: &Map<String, Value>) -> SchemaResult<()> {
    for (key, value) in map {
        if key.starts_with('$') {
            continue;
        }
        if !is_identifier(key) {
            return Err(SchemaError::invalid_expression(format!(
                "`{key}` is not a valid relation alias"
            )));
        }
        match value {
            Value::Bool(true) => parent.add_child(RelationExpression::relation(key.as_str()))?,
            Value::Bool(false) => {}
            Value::Object(spec) => parent.add_child(parse_spec(key, spec)?)?,
            other => {
                return Err(SchemaError::invalid_expression(format!(
                    "`{key}` must be `true` or an object, found {}",
                    kind_of(other)
                )));
            }
        }
    }
    Ok(())
}

fn parse_spec(alias: &str, spec: &Map<String, Value>) -> SchemaResult<RelationExpression> {
    let relation = match spec.get(RELATION_KEY) {
        None => alias,
        Some(Value::String(name)) if is_identifier(name) => name.as_str(),
        Some(other) => {
            return Err(SchemaError::invalid_expression(format!(
                "`{RELATION_KEY}` of `{alias}` must be a relation name, found {other}"
            )));
        }
    };

    let mut node = RelationExpression::relation(relation).with_alias(alias);

    for (key, value) in spec {
        match key.as_str() {
            RELATION_KEY => {}
            RECURSIVE_KEY => node.set_recursion(parse_recursive(alias, value)?),
            MODIFY_KEY => {
                for modifier in parse_modify(alias, value)? {
                    node.push_modifier(modifier);
                }
            }
            other if other.starts_with('$') => {
                return Err(SchemaError::invalid_expression(format!(
                    "unknown key `{other}` in `{alias}`"
                )));
            }
            _ => {}
        }
    }

    add_children(&mut node, spec)?;
    Ok(node)
}

fn parse_recursive(alias: &str, value: &Value) -> SchemaResult<Option<Recursion>> {
    match value {
        Value::Bool(true) => Ok(Some(Recursion::Infinite)),
        Value::Bool(false) => Ok(None),
        Value::Number(n) => match n.as_u64() {
            Some(depth) if depth >= 1 && depth <= u64::from(u32::MAX) => {
                Ok(Some(Recursion::Depth(depth as u32)))
            }
            _ => Err(SchemaError::invalid_expression(format!(
                "`{RECURSIVE_KEY}` of `{alias}` must be a positive integer, found {n}"
            ))),
        },
        other => Err(SchemaError::invalid_expression(format!(
            "`{RECURSIVE_KEY}` of `{alias}` must be `true` or a depth, found {}",
            kind_of(other)
        ))),
    }
}

fn parse_modify(alias: &str, value: &Value) -> SchemaResult<Vec<ModifierCall>> {
    let invalid = || {
        SchemaError::invalid_expression(format!(
            "`{MODIFY_KEY}` of `{alias}` must be a modifier name or a list of names"
        ))
    };
    match value {
        Value::String(name) if is_identifier(name) => Ok(vec![ModifierCall::new(name.as_str())]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(name) if is_identifier(name) => Ok(ModifierCall::new(name.as_str())),
                _ => Err(invalid()),
            })
            .collect(),
        _ => Err(invalid()),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
