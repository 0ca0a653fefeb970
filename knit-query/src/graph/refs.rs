//! `#id` labels and `#ref{label.field}` templates.
//!
//! A template that makes up a whole string keeps the referenced value's type;
//! a template embedded in a longer string is interpolated as text. Labels are
//! resolved once, when their node has been written. Reading a label that is
//! still pending or was never declared is an error, never `null`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex_lite::{Captures, Regex};
use serde_json::Value;
use smol_str::SmolStr;

use super::NodeId;
use crate::error::{QueryError, QueryResult};
use crate::value::Record;

static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#ref\{([^.}]+)\.([^}]+)\}").expect("static pattern"));

/// A `#ref{label.field}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Referenced label.
    pub label: SmolStr,
    /// Referenced field.
    pub field: SmolStr,
}

/// Resolution state of a label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefState<'a> {
    /// The labelled node has been written.
    Resolved(&'a Record),
    /// Declared by this node but not written yet.
    Pending(NodeId),
    /// Never declared.
    Unknown,
}

#[derive(Debug, Clone)]
struct Entry {
    node: NodeId,
    values: Option<Record>,
}

/// Label table of one planning and execution run.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    entries: HashMap<SmolStr, Entry>,
}

impl ReferenceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `label` on `node`.
    pub fn declare(&mut self, label: impl Into<SmolStr>, node: NodeId) -> QueryResult<()> {
        let label = label.into();
        if self.entries.contains_key(&label) {
            return Err(QueryError::duplicate_id(label.as_str()));
        }
        self.entries.insert(label, Entry { node, values: None });
        Ok(())
    }

    /// Node declaring `label`.
    pub fn node_of(&self, label: &str) -> Option<NodeId> {
        self.entries.get(label).map(|e| e.node)
    }

    /// State of `label`.
    pub fn resolve(&self, label: &str) -> RefState<'_> {
        match self.entries.get(label) {
            Some(Entry { values: Some(values), .. }) => RefState::Resolved(values),
            Some(Entry { node, values: None }) => RefState::Pending(*node),
            None => RefState::Unknown,
        }
    }

    /// Record the written values of `label`. Labels resolve once.
    pub fn set_resolved(&mut self, label: &str, values: Record) -> QueryResult<()> {
        let entry = self
            .entries
            .get_mut(label)
            .ok_or_else(|| QueryError::unresolved_reference(label))?;
        if entry.values.is_some() {
            return Err(QueryError::invalid_reference(format!(
                "label `{label}` is already resolved"
            )));
        }
        entry.values = Some(values);
        Ok(())
    }

    /// Number of declared labels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no label is declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace every template in `value` with the referenced values.
    pub fn substitute(&self, value: &Value) -> QueryResult<Value> {
        match value {
            Value::String(s) => self.substitute_str(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.substitute(item))
                .collect::<QueryResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.substitute(v)?)))
                .collect::<QueryResult<serde_json::Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn substitute_str(&self, s: &str) -> QueryResult<Value> {
        if let Some(caps) = TEMPLATE.captures(s) {
            if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
                return self.lookup(&caps[1], &caps[2]).cloned();
            }
        } else {
            return Ok(Value::String(s.to_string()));
        }

        let mut failure = None;
        let replaced = TEMPLATE.replace_all(s, |caps: &Captures<'_>| match self.lookup(&caps[1], &caps[2]) {
            Ok(Value::String(text)) => text.clone(),
            Ok(other) => other.to_string(),
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(Value::String(replaced.into_owned())),
        }
    }

    fn lookup(&self, label: &str, field: &str) -> QueryResult<&Value> {
        match self.resolve(label) {
            RefState::Resolved(values) => values.get(field).ok_or_else(|| {
                QueryError::unresolved_reference(label)
                    .with_field(field)
                    .with_help(format!("the node labelled `{label}` has no field `{field}`"))
            }),
            RefState::Pending(node) => Err(QueryError::unresolved_reference(label)
                .with_help(format!("node {node} declaring `{label}` has not been written yet"))),
            RefState::Unknown => Err(QueryError::unresolved_reference(label)),
        }
    }
}

/// Templates occurring anywhere in `value`, in order.
pub fn references_in(value: &Value) -> Vec<Reference> {
    let mut out = Vec::new();
    collect(value, &mut out);
    out
}

fn collect(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::String(s) => {
            for caps in TEMPLATE.captures_iter(s) {
                out.push(Reference {
                    label: SmolStr::new(&caps[1]),
                    field: SmolStr::new(&caps[2]),
                });
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect(item, out)),
        Value::Object(map) => map.values().for_each(|v| collect(v, out)),
        _ => {}
    }
}

/// Whether `value` contains a template.
pub fn has_references(value: &Value) -> bool {
    match value {
        Value::String(s) => TEMPLATE.is_match(s),
        Value::Array(items) => items.iter().any(has_references),
        Value::Object(map) => map.values().any(has_references),
        _ => false,
    }
}
