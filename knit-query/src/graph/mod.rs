//! Object graphs submitted for insert or upsert.
//!
//! A graph is an arena of [`GraphNode`]s addressed by [`NodeId`]. Nodes are
//! built from JSON: keys naming a relation of the node's model become relation
//! slots, `#id` labels a node, `#ref` makes a node a reference to a labelled
//! node, and everything else is a plain field.
//!
//! ```rust
//! use knit_query::graph::Graph;
//! use knit_schema::{ModelDescriptor, ModelRegistry, RelationDescriptor};
//! use serde_json::json;
//!
//! let registry = ModelRegistry::builder()
//!     .model(
//!         ModelDescriptor::new("Person", "persons")
//!             .relation(RelationDescriptor::has_many("pets", "Animal").related(["owner_id"])),
//!     )
//!     .model(ModelDescriptor::new("Animal", "animals"))
//!     .build()
//!     .unwrap();
//!
//! let graph = Graph::from_json(&registry, "Person", &json!({
//!     "name": "Jennifer",
//!     "pets": [{ "name": "Fluffy" }, { "name": "Rex" }]
//! }))
//! .unwrap();
//!
//! assert_eq!(graph.len(), 3);
//! let root = graph.node(graph.roots()[0]);
//! assert_eq!(root.relations["pets"].nodes.len(), 2);
//! ```

pub mod executor;
pub mod index;
pub mod operation;
pub mod options;
pub mod planner;
pub mod refs;

use std::fmt;

use indexmap::IndexMap;
use knit_schema::RelationExpression;
use knit_schema::model::{ModelRegistry, RelationKind};
use serde_json::{Map, Value};
use smol_str::SmolStr;

use crate::error::{QueryError, QueryResult};

/// Key labelling a node for references.
pub const ID_KEY: &str = "#id";
/// Key making a node a reference to a labelled node.
pub const REF_KEY: &str = "#ref";

/// Index of a node in its [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position in the arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The relation slot a node was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    /// Parent node.
    pub node: NodeId,
    /// Relation of the parent's model.
    pub relation: SmolStr,
}

/// A relation slot of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRelation {
    /// Kind of the relation.
    pub kind: RelationKind,
    /// Related nodes in input order.
    pub nodes: Vec<NodeId>,
    /// The slot was given as `null`.
    pub explicit_null: bool,
}

/// One row of a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    /// Own id.
    pub id: NodeId,
    /// Model name.
    pub model: SmolStr,
    /// Plain fields in input order.
    pub data: IndexMap<String, Value>,
    /// `#id` label.
    pub id_label: Option<SmolStr>,
    /// `#ref` target label.
    pub ref_label: Option<SmolStr>,
    /// Relation slots present in the input, keyed by relation name.
    pub relations: IndexMap<SmolStr, GraphRelation>,
    /// Where the node hangs; `None` for roots.
    pub parent: Option<ParentLink>,
    /// Relation names from the root, joined by `.` (empty for roots).
    pub path: String,
}

impl GraphNode {
    /// Plain fields as a record.
    pub fn record(&self) -> crate::value::Record {
        self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Whether the node is a `#ref` to another node.
    pub fn is_reference(&self) -> bool {
        self.ref_label.is_some()
    }
}

/// Arena of graph nodes with the roots in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    roots: Vec<NodeId>,
    model: SmolStr,
}

impl Graph {
    /// An empty graph of `model`.
    pub fn empty(model: impl Into<SmolStr>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Build a graph from an object or an array of objects.
    pub fn from_json(registry: &ModelRegistry, model: &str, value: &Value) -> QueryResult<Self> {
        registry.model(model)?;
        let mut graph = Self::empty(model);
        match value {
            Value::Object(map) => {
                let root = graph.add_node(registry, model, map, None, String::new())?;
                graph.roots.push(root);
            }
            Value::Array(items) => {
                for item in items {
                    let Value::Object(map) = item else {
                        return Err(QueryError::invalid_graph(format!(
                            "graph roots must be objects, found {item}"
                        ))
                        .with_model(model));
                    };
                    let root = graph.add_node(registry, model, map, None, String::new())?;
                    graph.roots.push(root);
                }
            }
            other => {
                return Err(QueryError::invalid_graph(format!(
                    "a graph is an object or an array of objects, found {other}"
                ))
                .with_model(model));
            }
        }
        Ok(graph)
    }

    /// Build a graph from loaded rows with nested relations.
    pub fn from_records(
        registry: &ModelRegistry,
        model: &str,
        rows: &[crate::value::Record],
    ) -> QueryResult<Self> {
        let value = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        Self::from_json(registry, model, &value)
    }

    fn add_node(
        &mut self,
        registry: &ModelRegistry,
        model: &str,
        map: &Map<String, Value>,
        parent: Option<ParentLink>,
        path: String,
    ) -> QueryResult<NodeId> {
        let descriptor = registry.model(model)?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(GraphNode {
            id,
            model: descriptor.name.clone(),
            data: IndexMap::new(),
            id_label: None,
            ref_label: None,
            relations: IndexMap::new(),
            parent,
            path: path.clone(),
        });

        for (key, value) in map {
            match key.as_str() {
                ID_KEY => self.nodes[id.0].id_label = Some(label(model, key, value)?),
                REF_KEY => self.nodes[id.0].ref_label = Some(label(model, key, value)?),
                _ => match descriptor.get_relation(key) {
                    Some(relation) => {
                        let child_path = if path.is_empty() {
                            key.clone()
                        } else {
                            format!("{path}.{key}")
                        };
                        let slot = self.add_relation(
                            registry,
                            id,
                            relation.name.as_str(),
                            relation.kind,
                            &relation.related_model,
                            value,
                            child_path,
                        )?;
                        self.nodes[id.0].relations.insert(relation.name.clone(), slot);
                    }
                    None => {
                        self.nodes[id.0].data.insert(key.clone(), value.clone());
                    }
                },
            }
        }
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_relation(
        &mut self,
        registry: &ModelRegistry,
        owner: NodeId,
        relation: &str,
        kind: RelationKind,
        related_model: &str,
        value: &Value,
        path: String,
    ) -> QueryResult<GraphRelation> {
        let link = || ParentLink {
            node: owner,
            relation: SmolStr::new(relation),
        };
        let mut slot = GraphRelation {
            kind,
            nodes: Vec::new(),
            explicit_null: false,
        };
        match value {
            Value::Null => slot.explicit_null = true,
            Value::Object(map) => {
                let child = self.add_node(registry, related_model, map, Some(link()), path)?;
                slot.nodes.push(child);
            }
            Value::Array(items) => {
                if kind.is_one() && items.len() > 1 {
                    return Err(QueryError::invalid_graph(format!(
                        "relation `{relation}` holds one row, found {}",
                        items.len()
                    ))
                    .with_field(relation));
                }
                for item in items {
                    let Value::Object(map) = item else {
                        return Err(QueryError::invalid_graph(format!(
                            "rows of relation `{relation}` must be objects, found {item}"
                        ))
                        .with_field(relation));
                    };
                    let child =
                        self.add_node(registry, related_model, map, Some(link()), path.clone())?;
                    slot.nodes.push(child);
                }
            }
            other => {
                return Err(QueryError::invalid_graph(format!(
                    "relation `{relation}` must be an object, an array or null, found {other}"
                ))
                .with_field(relation));
            }
        }
        Ok(slot)
    }

    /// Model of the roots.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Root nodes in input order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Look up a node.
    ///
    /// # Panics
    ///
    /// Panics if `id` belongs to another graph.
    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    /// Look up a node, `None` if `id` is out of range.
    pub fn get(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(id.0)
    }

    /// All nodes in creation (depth-first input) order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Expression loading every relation slot present in the graph.
    pub fn relation_expression(&self) -> RelationExpression {
        let mut root = RelationExpression::root();
        for &id in &self.roots {
            root = self.with_slots(root, id);
        }
        root
    }

    fn with_slots(&self, mut expr: RelationExpression, id: NodeId) -> RelationExpression {
        for (name, slot) in &self.node(id).relations {
            let mut child = RelationExpression::relation(name.clone());
            for &node in &slot.nodes {
                child = self.with_slots(child, node);
            }
            expr = expr.with_child(child);
        }
        expr
    }

    /// The graph as JSON, with `#id`/`#ref` markers.
    pub fn to_json(&self) -> Value {
        Value::Array(self.roots.iter().map(|&id| self.node_json(id)).collect())
    }

    fn node_json(&self, id: NodeId) -> Value {
        let node = self.node(id);
        let mut map: Map<String, Value> = node.record();
        if let Some(label) = &node.id_label {
            map.insert(ID_KEY.to_string(), Value::String(label.to_string()));
        }
        if let Some(label) = &node.ref_label {
            map.insert(REF_KEY.to_string(), Value::String(label.to_string()));
        }
        for (name, slot) in &node.relations {
            let value = if slot.kind.is_many() {
                Value::Array(slot.nodes.iter().map(|&n| self.node_json(n)).collect())
            } else {
                slot.nodes.first().map(|&n| self.node_json(n)).unwrap_or(Value::Null)
            };
            map.insert(name.to_string(), value);
        }
        Value::Object(map)
    }
}

fn label(model: &str, key: &str, value: &Value) -> QueryResult<SmolStr> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(SmolStr::new(s)),
        other => Err(QueryError::invalid_graph(format!("`{key}` must be a non-empty string, found {other}"))
            .with_model(model)
            .with_field(key)),
    }
}
