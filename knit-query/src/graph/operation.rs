//! Planned database writes.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;
use smol_str::SmolStr;

use super::index::NodeState;
use super::refs::ReferenceTable;
use super::{NodeId, ParentLink};
use crate::value::{IdentityKey, Record};

/// Where the value of a written column comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSource {
    /// A literal.
    Value(Value),
    /// A literal holding `#ref{label.field}` templates, substituted before
    /// the write.
    Template(Value),
    /// A column of another node, known once that node is written.
    Column {
        /// Node holding the value.
        node: NodeId,
        /// Column to read.
        column: SmolStr,
    },
}

impl FieldSource {
    /// The literal, if this is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) | Self::Template(value) => write!(f, "{value}"),
            Self::Column { node, column } => write!(f, "{node}.{column}"),
        }
    }
}

/// A persisted row a relation is removed from.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedParent {
    /// Model of the parent row.
    pub model: SmolStr,
    /// Relation of the parent's model.
    pub relation: SmolStr,
    /// Persisted values of the parent row.
    pub values: Record,
}

/// One write of a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Insert an incoming node.
    Insert {
        /// Model of the row.
        model: SmolStr,
        /// Incoming node.
        node: NodeId,
        /// Column values.
        fields: IndexMap<String, FieldSource>,
        /// Slot the node was found in.
        parent: Option<ParentLink>,
    },
    /// Update changed fields of a persisted row.
    Patch {
        /// Model of the row.
        model: SmolStr,
        /// Incoming node.
        node: NodeId,
        /// Primary key of the persisted row.
        identity: IdentityKey,
        /// Primary key columns and values.
        key: Record,
        /// Changed fields.
        changes: IndexMap<String, FieldSource>,
    },
    /// Delete a persisted row.
    Delete {
        /// Model of the row.
        model: SmolStr,
        /// Primary key of the row.
        identity: IdentityKey,
        /// Primary key columns and values.
        key: Record,
    },
    /// Link a node into the relation of its parent.
    Relate {
        /// Model of the related row.
        model: SmolStr,
        /// Node being related (the labelled node for `#ref`s).
        node: NodeId,
        /// Parent node and relation.
        parent: ParentLink,
        /// Extra join-table columns.
        through_data: IndexMap<String, FieldSource>,
    },
    /// Remove a persisted row from the relation of a persisted parent.
    Unrelate {
        /// Model of the related row.
        model: SmolStr,
        /// Primary key of the related row.
        identity: IdentityKey,
        /// Persisted values of the related row.
        values: Record,
        /// Parent row and relation.
        parent: PersistedParent,
    },
}

impl Operation {
    /// Model written by the operation.
    pub fn model(&self) -> &str {
        match self {
            Self::Insert { model, .. }
            | Self::Patch { model, .. }
            | Self::Delete { model, .. }
            | Self::Relate { model, .. }
            | Self::Unrelate { model, .. } => model,
        }
    }

    /// Primary key of a persisted row, if the operation targets one.
    pub fn identity(&self) -> Option<&IdentityKey> {
        match self {
            Self::Patch { identity, .. } | Self::Delete { identity, .. } | Self::Unrelate { identity, .. } => {
                Some(identity)
            }
            Self::Insert { .. } | Self::Relate { .. } => None,
        }
    }

    /// Incoming node of the operation.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Insert { node, .. } | Self::Patch { node, .. } | Self::Relate { node, .. } => Some(*node),
            Self::Delete { .. } | Self::Unrelate { .. } => None,
        }
    }

    /// Short name of the operation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Patch { .. } => "patch",
            Self::Delete { .. } => "delete",
            Self::Relate { .. } => "relate",
            Self::Unrelate { .. } => "unrelate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert { model, node, .. } => write!(f, "insert {model} {node}"),
            Self::Patch { model, identity, changes, .. } => {
                write!(f, "patch {model} {identity} {{")?;
                for (i, (field, source)) in changes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}: {source}")?;
                }
                f.write_str("}")
            }
            Self::Delete { model, identity, .. } => write!(f, "delete {model} {identity}"),
            Self::Relate { model, node, parent, .. } => {
                write!(f, "relate {model} {node} to {}.{}", parent.node, parent.relation)
            }
            Self::Unrelate { model, identity, parent, .. } => {
                write!(f, "unrelate {model} {identity} from {}.{}", parent.model, parent.relation)
            }
        }
    }
}

/// A node of either side of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// Node of the incoming graph.
    Incoming(NodeId),
    /// Node of the persisted graph.
    Existing(NodeId),
}

/// Dependency-ordered writes of one graph, with the diff that produced them.
#[derive(Debug, Clone, Default)]
pub struct OperationPlan {
    /// Writes in execution order.
    pub operations: Vec<Operation>,
    /// Classification of every visited node.
    pub states: IndexMap<NodeRef, NodeState>,
    /// Persisted values of incoming nodes that match a stored row.
    pub seeds: HashMap<NodeId, Record>,
    /// Labels declared by the incoming graph, unresolved.
    pub references: ReferenceTable,
}

impl OperationPlan {
    /// Number of writes.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the plan writes nothing.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Writes in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.operations.iter()
    }

    /// State of an incoming node.
    pub fn state(&self, node: NodeId) -> Option<&NodeState> {
        self.states.get(&NodeRef::Incoming(node))
    }

    /// Count of operations per kind, e.g. `[("insert", 2), ("relate", 1)]`.
    pub fn summary(&self) -> Vec<(&'static str, usize)> {
        let mut counts: IndexMap<&'static str, usize> = IndexMap::new();
        for op in &self.operations {
            *counts.entry(op.kind()).or_default() += 1;
        }
        counts.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a OperationPlan {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
