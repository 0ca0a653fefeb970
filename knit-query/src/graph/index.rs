//! Node identities and labels of a graph.

use std::collections::HashMap;
use std::fmt;

use knit_schema::model::ModelRegistry;
use smol_str::SmolStr;

use super::refs::ReferenceTable;
use super::{Graph, NodeId};
use crate::error::{QueryError, QueryResult};
use crate::value::IdentityKey;

/// How a node is identified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Every primary key column is present and non-null.
    Key(IdentityKey),
    /// No primary key, but an `#id` label.
    Label(SmolStr),
    /// Neither.
    None,
}

impl Identity {
    /// The primary key, if any.
    pub fn key(&self) -> Option<&IdentityKey> {
        match self {
            Self::Key(key) => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "{key}"),
            Self::Label(label) => write!(f, "#id {label}"),
            Self::None => f.write_str("(new)"),
        }
    }
}

/// Diff classification of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    /// Not persisted; will be inserted.
    New,
    /// Persisted and equal on every given field.
    Unchanged,
    /// Persisted with these fields differing.
    Changed(Vec<String>),
    /// Persisted but missing from the incoming graph.
    Absent,
}

/// Lookup tables over one graph.
#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    identities: Vec<Identity>,
    by_id_label: HashMap<SmolStr, NodeId>,
    by_identity: HashMap<(SmolStr, IdentityKey), Vec<NodeId>>,
}

impl GraphIndex {
    /// Index `graph`, declaring every `#id` in `refs`.
    ///
    /// Fails on a duplicate `#id`, a `#ref` to an undeclared label, or a
    /// `#ref` to a node of another model.
    pub fn build(graph: &Graph, registry: &ModelRegistry, refs: &mut ReferenceTable) -> QueryResult<Self> {
        let mut index = Self {
            identities: Vec::with_capacity(graph.len()),
            ..Self::default()
        };

        for node in graph.nodes() {
            let model = registry.model(&node.model)?;
            let record = node.record();
            let identity = match IdentityKey::from_record(&record, &model.id_columns) {
                Some(key) => {
                    index
                        .by_identity
                        .entry((node.model.clone(), key.clone()))
                        .or_default()
                        .push(node.id);
                    Identity::Key(key)
                }
                None => match &node.id_label {
                    Some(label) => Identity::Label(label.clone()),
                    None => Identity::None,
                },
            };
            index.identities.push(identity);

            if let Some(label) = &node.id_label {
                refs.declare(label.clone(), node.id)
                    .map_err(|e| e.with_model(node.model.as_str()))?;
                index.by_id_label.insert(label.clone(), node.id);
            }
        }

        for node in graph.nodes() {
            let Some(label) = &node.ref_label else {
                continue;
            };
            let target = index
                .by_id_label
                .get(label)
                .ok_or_else(|| QueryError::unresolved_reference(label.as_str()).with_model(node.model.as_str()))?;
            let target_model = &graph.node(*target).model;
            if *target_model != node.model {
                return Err(QueryError::invalid_reference(format!(
                    "`#ref` {label} points to a {target_model} but sits in a {} slot",
                    node.model
                ))
                .with_model(node.model.as_str()));
            }
        }

        Ok(index)
    }

    /// Identity of a node.
    pub fn identity(&self, node: NodeId) -> &Identity {
        self.identities.get(node.0).unwrap_or(&Identity::None)
    }

    /// Node declaring `label`.
    pub fn by_label(&self, label: &str) -> Option<NodeId> {
        self.by_id_label.get(label).copied()
    }

    /// Nodes of `model` with primary key `key`, in input order.
    pub fn find(&self, model: &str, key: &IdentityKey) -> &[NodeId] {
        self.by_identity
            .get(&(SmolStr::new(model), key.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The node `node` stands for: its `#ref` target, or itself.
    pub fn target(&self, graph: &Graph, node: NodeId) -> NodeId {
        graph
            .node(node)
            .ref_label
            .as_deref()
            .and_then(|label| self.by_label(label))
            .unwrap_or(node)
    }
}
