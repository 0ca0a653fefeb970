//! Diff of an incoming graph against the persisted one, and the ordered writes
//! that apply it.
//!
//! Planning is pure: every shape, reference and ordering error surfaces here,
//! before a single statement runs.
//!
//! Writes are ordered by a dependency graph:
//!
//! - a row holding a foreign key is written after the row it points to
//!   (belongs-to-one children first, has-one/has-many children after);
//! - join-table rows are written after both ends;
//! - a write holding `#ref{label.field}` templates follows the insert of the
//!   labelled node;
//! - a cascaded delete follows the deletes of its owned rows.
//!
//! Ties keep traversal order, so equal inputs give equal plans.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use indexmap::IndexMap;
use knit_schema::model::{ModelRegistry, RelationDescriptor, RelationKind};
use serde_json::Value;
use smol_str::SmolStr;
use tracing::debug;

use super::index::{GraphIndex, NodeState};
use super::operation::{FieldSource, NodeRef, Operation, OperationPlan, PersistedParent};
use super::options::UpsertOptions;
use super::refs::{ReferenceTable, has_references, references_in};
use super::{Graph, NodeId, ParentLink};
use crate::error::{QueryError, QueryResult};
use crate::value::{IdentityKey, Record, values_equal};

/// Plan the writes turning `existing` into `incoming`.
///
/// Without `existing` every row is inserted (or related, for `#ref`s and with
/// `relate`) and templates are always substituted.
pub fn plan(
    registry: &ModelRegistry,
    existing: Option<&Graph>,
    incoming: &Graph,
    options: &UpsertOptions,
) -> QueryResult<OperationPlan> {
    let mut references = ReferenceTable::new();
    let index = GraphIndex::build(incoming, registry, &mut references)?;
    let existing_index = match existing {
        Some(graph) => GraphIndex::build(graph, registry, &mut ReferenceTable::new())?,
        None => GraphIndex::default(),
    };

    let mut planner = Planner {
        registry,
        incoming,
        existing,
        index,
        existing_index,
        options,
        pending: Vec::new(),
        writes: HashMap::new(),
        states: IndexMap::new(),
        seeds: HashMap::new(),
        claimed: HashSet::new(),
    };
    planner.plan_roots()?;
    let plan = planner.finish(references)?;

    debug!(
        model = incoming.model(),
        upsert = existing.is_some(),
        operations = plan.len(),
        summary = ?plan.summary(),
        "planned graph"
    );
    Ok(plan)
}

enum Need {
    /// The insert of a node, if it is inserted.
    Write(NodeId),
    /// A planned operation.
    Op(usize),
}

struct Pending {
    op: Operation,
    needs: Vec<Need>,
}

struct Planner<'a> {
    registry: &'a ModelRegistry,
    incoming: &'a Graph,
    existing: Option<&'a Graph>,
    index: GraphIndex,
    existing_index: GraphIndex,
    options: &'a UpsertOptions,
    pending: Vec<Pending>,
    writes: HashMap<NodeId, usize>,
    states: IndexMap<NodeRef, NodeState>,
    seeds: HashMap<NodeId, Record>,
    claimed: HashSet<NodeId>,
}

impl<'a> Planner<'a> {
    fn is_upsert(&self) -> bool {
        self.existing.is_some()
    }

    fn push(&mut self, op: Operation, needs: Vec<Need>) -> usize {
        self.pending.push(Pending { op, needs });
        self.pending.len() - 1
    }

    fn plan_roots(&mut self) -> QueryResult<()> {
        let persisted_roots: HashMap<IdentityKey, NodeId> = match self.existing {
            Some(existing) => existing
                .roots()
                .iter()
                .filter_map(|&id| self.existing_index.identity(id).key().map(|k| (k.clone(), id)))
                .collect(),
            None => HashMap::new(),
        };

        let incoming = self.incoming;
        for &root in incoming.roots() {
            let node = incoming.node(root);
            if node.is_reference() {
                return Err(QueryError::invalid_graph("a root row cannot be a `#ref`").with_model(node.model.as_str()));
            }

            let key = self.index.identity(root).key().cloned();
            if let Some(persisted) = key.as_ref().and_then(|k| persisted_roots.get(k)).copied() {
                if self.claimed.insert(persisted) {
                    self.visit_matched(root, persisted)?;
                    continue;
                }
            }

            if self.is_upsert() {
                if let Some(key) = &key {
                    if !self.options.insert_missing.enabled_for("") {
                        return Err(QueryError::record_not_found(node.model.as_str(), key.to_string()));
                    }
                }
                if self.options.no_insert.enabled_for("") {
                    continue;
                }
            }
            self.visit_new(root)?;
        }
        Ok(())
    }

    /// Diff a node against the persisted row it matched.
    fn visit_matched(&mut self, node: NodeId, persisted: NodeId) -> QueryResult<()> {
        let existing = self.existing.ok_or_else(|| QueryError::internal("matched a row without a persisted graph"))?;
        let incoming_node = self.incoming.node(node);
        let persisted_node = existing.node(persisted);
        let extras = self.through_extras(node)?;

        let mut changed = Vec::new();
        let mut changes = IndexMap::new();
        let mut needs = Vec::new();
        for (field, value) in &incoming_node.data {
            if extras.contains(field.as_str()) {
                continue;
            }
            let source = self.source(value, &incoming_node.path);
            let same = matches!(source, FieldSource::Value(_))
                && persisted_node.data.get(field).is_some_and(|old| values_equal(old, value));
            if !same {
                needs.extend(self.template_needs(&source)?);
                changed.push(field.clone());
                changes.insert(field.clone(), source);
            }
        }

        self.seeds.insert(node, persisted_node.record());
        let state = if changed.is_empty() {
            NodeState::Unchanged
        } else {
            NodeState::Changed(changed)
        };
        self.states.insert(NodeRef::Incoming(node), state);

        if !changes.is_empty() && !self.options.no_update.enabled_for(&incoming_node.path) {
            let (identity, key) = self.persisted_key(persisted)?;
            self.push(
                Operation::Patch {
                    model: incoming_node.model.clone(),
                    node,
                    identity,
                    key,
                    changes,
                },
                needs,
            );
        }

        self.visit_slots(node, Some(persisted))
    }

    /// Plan the insert of a node and walk its relation slots.
    fn visit_new(&mut self, node: NodeId) -> QueryResult<()> {
        let incoming_node = self.incoming.node(node);
        if let Some(key) = self.index.identity(node).key() {
            let twins = self.index.find(&incoming_node.model, key);
            if twins.iter().any(|twin| *twin != node && self.writes.contains_key(twin)) {
                return Err(QueryError::invalid_graph(format!(
                    "{} row {key} is inserted twice",
                    incoming_node.model
                ))
                .with_model(incoming_node.model.as_str())
                .with_identity(key.to_string()));
            }
        }
        let extras = self.through_extras(node)?;

        let mut fields = IndexMap::new();
        let mut needs = Vec::new();
        for (field, value) in &incoming_node.data {
            if extras.contains(field.as_str()) {
                continue;
            }
            let source = self.source(value, &incoming_node.path);
            needs.extend(self.template_needs(&source)?);
            fields.insert(field.clone(), source);
        }

        if let (Some(relation), Some(link)) = (self.parent_relation(node)?, &incoming_node.parent) {
            if relation.kind.is_owning() {
                for (owner, related) in relation.owner_columns.iter().zip(&relation.related_columns) {
                    fields.insert(
                        related.to_string(),
                        FieldSource::Column {
                            node: link.node,
                            column: owner.clone(),
                        },
                    );
                }
                needs.push(Need::Write(link.node));
            }
        }

        let index = self.push(
            Operation::Insert {
                model: incoming_node.model.clone(),
                node,
                fields,
                parent: incoming_node.parent.clone(),
            },
            needs,
        );
        self.writes.insert(node, index);
        self.states.insert(NodeRef::Incoming(node), NodeState::New);

        self.visit_slots(node, None)
    }

    /// Walk the relation slots of `node`, `persisted` being the stored row it
    /// matched.
    fn visit_slots(&mut self, node: NodeId, persisted: Option<NodeId>) -> QueryResult<()> {
        let incoming = self.incoming;
        let registry = self.registry;
        let incoming_node = incoming.node(node);

        for (name, slot) in &incoming_node.relations {
            let relation = registry.relation(&incoming_node.model, name)?;
            let path = child_path(&incoming_node.path, name);
            let persisted_slot: Vec<NodeId> = match (self.existing, persisted) {
                (Some(existing), Some(persisted)) => existing
                    .node(persisted)
                    .relations
                    .get(name)
                    .map(|s| s.nodes.clone())
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let mut used = HashSet::new();

            for (position, &child) in slot.nodes.iter().enumerate() {
                let child_node = incoming.node(child);

                if child_node.is_reference() {
                    let target = self.index.target(incoming, child);
                    let linked = self
                        .index
                        .identity(target)
                        .key()
                        .and_then(|key| self.find_persisted(&persisted_slot, &used, key));
                    match linked {
                        Some(persisted) => {
                            used.insert(persisted);
                        }
                        None => self.link(node, relation, target, child)?,
                    }
                    continue;
                }

                let key = self.index.identity(child).key().cloned();
                let matched = match &key {
                    Some(key) => self.find_persisted(&persisted_slot, &used, key),
                    None if self.options.match_by_position.enabled_for(&path) => persisted_slot
                        .get(position)
                        .copied()
                        .filter(|p| !used.contains(p) && !self.claimed.contains(p)),
                    None => None,
                };
                if let Some(persisted) = matched {
                    used.insert(persisted);
                    self.claimed.insert(persisted);
                    self.visit_matched(child, persisted)?;
                    continue;
                }

                if let Some(key) = &key {
                    let identity_only = self.is_upsert()
                        && relation.kind == RelationKind::ManyToMany
                        && self.identity_only(child, relation)?;
                    if self.options.relate.enabled_for(&path) || identity_only {
                        self.states.insert(NodeRef::Incoming(child), NodeState::Unchanged);
                        self.seeds.insert(child, child_node.record());
                        self.link(node, relation, child, child)?;
                        self.visit_slots(child, None)?;
                        continue;
                    }
                    if self.is_upsert() && !self.options.insert_missing.enabled_for(&path) {
                        return Err(QueryError::record_not_found(child_node.model.as_str(), key.to_string())
                            .with_field(path.as_str()));
                    }
                }

                if self.is_upsert() && self.options.no_insert.enabled_for(&path) {
                    continue;
                }
                self.visit_new(child)?;
                if !relation.kind.is_owning() {
                    self.link(node, relation, child, child)?;
                }
            }

            if slot.explicit_null && relation.kind == RelationKind::BelongsToOne {
                if let Some(&write) = self.writes.get(&node) {
                    let fields = self.insert_fields(write)?;
                    for owner in &relation.owner_columns {
                        fields.insert(owner.to_string(), FieldSource::Value(Value::Null));
                    }
                }
            }

            if let Some(persisted) = persisted {
                if self.options.no_delete.enabled_for(&path) {
                    continue;
                }
                for &old in &persisted_slot {
                    if used.contains(&old) || self.claimed.contains(&old) {
                        continue;
                    }
                    self.remove(persisted, relation, old, slot.nodes.is_empty(), &path)?;
                }
            }
        }
        Ok(())
    }

    /// Link `target` into `relation` of `parent`. `carrier` is the node found
    /// in the slot and holds the join-table extras.
    fn link(
        &mut self,
        parent: NodeId,
        relation: &RelationDescriptor,
        target: NodeId,
        carrier: NodeId,
    ) -> QueryResult<()> {
        if relation.kind == RelationKind::BelongsToOne {
            if let Some(&write) = self.writes.get(&parent) {
                let fields = self.insert_fields(write)?;
                for (owner, related) in relation.owner_columns.iter().zip(&relation.related_columns) {
                    fields.insert(
                        owner.to_string(),
                        FieldSource::Column {
                            node: target,
                            column: related.clone(),
                        },
                    );
                }
                self.pending[write].needs.push(Need::Write(target));
                return Ok(());
            }
        }

        let carrier_node = self.incoming.node(carrier);
        let mut through_data = IndexMap::new();
        let mut needs = vec![Need::Write(target), Need::Write(parent)];
        if let Some(through) = &relation.through {
            for extra in &through.extra {
                if let Some(value) = carrier_node.data.get(extra.as_str()) {
                    let source = self.source(value, &carrier_node.path);
                    needs.extend(self.template_needs(&source)?);
                    through_data.insert(extra.to_string(), source);
                }
            }
        }

        self.push(
            Operation::Relate {
                model: relation.related_model.clone(),
                node: target,
                parent: ParentLink {
                    node: parent,
                    relation: relation.name.clone(),
                },
                through_data,
            },
            needs,
        );
        Ok(())
    }

    /// Remove persisted row `old` from `relation` of persisted row `parent`.
    fn remove(
        &mut self,
        parent: NodeId,
        relation: &RelationDescriptor,
        old: NodeId,
        slot_emptied: bool,
        path: &str,
    ) -> QueryResult<()> {
        match relation.kind {
            RelationKind::ManyToMany => {
                self.unrelate(parent, relation, old)?;
            }
            // A replaced belongs-to row is unlinked by the new foreign key
            RelationKind::BelongsToOne if !slot_emptied => return Ok(()),
            RelationKind::BelongsToOne => {
                self.unrelate(parent, relation, old)?;
            }
            _ if self.options.unrelate.enabled_for(path) => {
                self.unrelate(parent, relation, old)?;
            }
            _ => {
                self.delete_cascade(old)?;
            }
        }
        self.states.insert(NodeRef::Existing(old), NodeState::Absent);
        Ok(())
    }

    fn unrelate(&mut self, parent: NodeId, relation: &RelationDescriptor, old: NodeId) -> QueryResult<usize> {
        let existing = self.existing.ok_or_else(|| QueryError::internal("unrelate without a persisted graph"))?;
        let parent_node = existing.node(parent);
        let old_node = existing.node(old);
        let (identity, _) = self.persisted_key(old)?;
        Ok(self.push(
            Operation::Unrelate {
                model: old_node.model.clone(),
                identity,
                values: old_node.record(),
                parent: PersistedParent {
                    model: parent_node.model.clone(),
                    relation: relation.name.clone(),
                    values: parent_node.record(),
                },
            },
            Vec::new(),
        ))
    }

    /// Delete a persisted row after its owned rows and join-table links.
    fn delete_cascade(&mut self, old: NodeId) -> QueryResult<usize> {
        let existing = self.existing.ok_or_else(|| QueryError::internal("delete without a persisted graph"))?;
        let registry = self.registry;
        let node = existing.node(old);

        let mut needs = Vec::new();
        for (name, slot) in &node.relations {
            let relation = registry.relation(&node.model, name)?;
            for &child in &slot.nodes {
                if self.claimed.contains(&child) {
                    continue;
                }
                match relation.kind {
                    RelationKind::HasOne | RelationKind::HasMany => {
                        needs.push(Need::Op(self.delete_cascade(child)?));
                        self.states.insert(NodeRef::Existing(child), NodeState::Absent);
                    }
                    RelationKind::ManyToMany => needs.push(Need::Op(self.unrelate(old, relation, child)?)),
                    RelationKind::BelongsToOne => {}
                }
            }
        }

        let (identity, key) = self.persisted_key(old)?;
        Ok(self.push(
            Operation::Delete {
                model: node.model.clone(),
                identity,
                key,
            },
            needs,
        ))
    }

    fn find_persisted(&self, slot: &[NodeId], used: &HashSet<NodeId>, key: &IdentityKey) -> Option<NodeId> {
        slot.iter()
            .copied()
            .find(|p| !used.contains(p) && !self.claimed.contains(p) && self.existing_index.identity(*p).key() == Some(key))
    }

    fn persisted_key(&self, persisted: NodeId) -> QueryResult<(IdentityKey, Record)> {
        let existing = self.existing.ok_or_else(|| QueryError::internal("no persisted graph"))?;
        let node = existing.node(persisted);
        let identity = self
            .existing_index
            .identity(persisted)
            .key()
            .cloned()
            .ok_or_else(|| {
                QueryError::unexpected_result("persisted row has no primary key").with_model(node.model.as_str())
            })?;
        let model = self.registry.model(&node.model)?;
        let key = model
            .id_columns
            .iter()
            .filter_map(|c| node.data.get(c.as_str()).map(|v| (c.to_string(), v.clone())))
            .collect();
        Ok((identity, key))
    }

    /// Relation of the slot `node` was found in.
    fn parent_relation(&self, node: NodeId) -> QueryResult<Option<&'a RelationDescriptor>> {
        let incoming = self.incoming;
        let registry = self.registry;
        match &incoming.node(node).parent {
            Some(link) => {
                let parent = incoming.node(link.node);
                Ok(Some(registry.relation(&parent.model, &link.relation)?))
            }
            None => Ok(None),
        }
    }

    /// Join-table extras carried by `node`, if it sits in a many-to-many slot.
    fn through_extras(&self, node: NodeId) -> QueryResult<HashSet<&'a str>> {
        Ok(self
            .parent_relation(node)?
            .and_then(|r| r.through.as_ref())
            .map(|t| t.extra.iter().map(SmolStr::as_str).collect())
            .unwrap_or_default())
    }

    /// Whether `node` carries nothing but its key and join-table extras.
    fn identity_only(&self, node: NodeId, relation: &RelationDescriptor) -> QueryResult<bool> {
        let incoming_node = self.incoming.node(node);
        let model = self.registry.model(&incoming_node.model)?;
        let extras: HashSet<&str> = relation
            .through
            .as_ref()
            .map(|t| t.extra.iter().map(SmolStr::as_str).collect())
            .unwrap_or_default();
        Ok(incoming_node.relations.is_empty()
            && incoming_node
                .data
                .keys()
                .all(|f| extras.contains(f.as_str()) || model.id_columns.iter().any(|c| c.as_str() == f.as_str())))
    }

    fn templates_enabled(&self, path: &str) -> bool {
        !self.is_upsert() || self.options.allow_refs.enabled_for(path)
    }

    fn source(&self, value: &Value, path: &str) -> FieldSource {
        if self.templates_enabled(path) && has_references(value) {
            FieldSource::Template(value.clone())
        } else {
            FieldSource::Value(value.clone())
        }
    }

    fn template_needs(&self, source: &FieldSource) -> QueryResult<Vec<Need>> {
        let FieldSource::Template(value) = source else {
            return Ok(Vec::new());
        };
        references_in(value)
            .into_iter()
            .map(|reference| {
                self.index
                    .by_label(&reference.label)
                    .map(Need::Write)
                    .ok_or_else(|| QueryError::unresolved_reference(reference.label.as_str()))
            })
            .collect()
    }

    fn insert_fields(&mut self, write: usize) -> QueryResult<&mut IndexMap<String, FieldSource>> {
        match &mut self.pending[write].op {
            Operation::Insert { fields, .. } => Ok(fields),
            other => Err(QueryError::internal(format!("expected an insert, found {other}"))),
        }
    }

    /// Order the pending operations topologically, ties by creation order.
    fn finish(self, references: ReferenceTable) -> QueryResult<OperationPlan> {
        let count = self.pending.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut indegree = vec![0usize; count];

        for (index, pending) in self.pending.iter().enumerate() {
            let deps: BTreeSet<usize> = pending
                .needs
                .iter()
                .filter_map(|need| match need {
                    Need::Write(node) => self.writes.get(node).copied(),
                    Need::Op(op) => Some(*op),
                })
                .collect();
            for dep in deps {
                dependents[dep].push(index);
                indegree[index] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..count).filter(|&i| indegree[i] == 0).map(Reverse).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for &dependent in &dependents[index] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() < count {
            let mut models: Vec<String> = Vec::new();
            for (index, pending) in self.pending.iter().enumerate() {
                let model = pending.op.model().to_string();
                if indegree[index] > 0 && !models.contains(&model) {
                    models.push(model);
                }
            }
            return Err(QueryError::cyclic_graph(&models).with_model(self.incoming.model()));
        }

        let mut slots: Vec<Option<Operation>> = self.pending.into_iter().map(|p| Some(p.op)).collect();
        let operations = order.into_iter().filter_map(|i| slots[i].take()).collect();

        Ok(OperationPlan {
            operations,
            states: self.states,
            seeds: self.seeds,
            references,
        })
    }
}

fn child_path(parent: &str, relation: &str) -> String {
    if parent.is_empty() {
        relation.to_string()
    } else {
        format!("{parent}.{relation}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::graph::tests::registry;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn graph(registry: &ModelRegistry, value: Value) -> Graph {
        Graph::from_json(registry, "Person", &value).unwrap()
    }

    fn kinds(plan: &OperationPlan) -> Vec<String> {
        plan.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_insert_orders_belongs_to_first() {
        let registry = registry();
        let incoming = graph(&registry, json!({"name": "Kid", "parent": {"name": "Mom"}, "pets": [{"name": "Rex"}]}));
        let plan = plan(&registry, None, &incoming, &UpsertOptions::insert_graph()).unwrap();

        assert_eq!(kinds(&plan), vec!["insert Person #1", "insert Person #0", "insert Animal #2"]);
        let Operation::Insert { fields, .. } = &plan.operations[1] else {
            panic!("expected insert");
        };
        assert_eq!(
            fields["parent_id"],
            FieldSource::Column { node: NodeId(1), column: "id".into() }
        );
        let Operation::Insert { fields, .. } = &plan.operations[2] else {
            panic!("expected insert");
        };
        assert_eq!(
            fields["owner_id"],
            FieldSource::Column { node: NodeId(0), column: "id".into() }
        );
        assert!(plan.iter().all(|op| matches!(op, Operation::Insert { .. } | Operation::Relate { .. })));
    }

    #[test]
    fn test_many_to_many_insert_then_relate() {
        let registry = registry();
        let incoming = graph(&registry, json!({"name": "A", "movies": [{"title": "M", "role": "lead"}]}));
        let plan = plan(&registry, None, &incoming, &UpsertOptions::insert_graph()).unwrap();

        assert_eq!(
            kinds(&plan),
            vec!["insert Person #0", "insert Movie #1", "relate Movie #1 to #0.movies"]
        );
        let Operation::Insert { fields, .. } = &plan.operations[1] else {
            panic!("expected insert");
        };
        assert!(!fields.contains_key("role"));
        let Operation::Relate { through_data, .. } = &plan.operations[2] else {
            panic!("expected relate");
        };
        assert_eq!(through_data["role"], FieldSource::Value(json!("lead")));
    }

    #[test]
    fn test_templates_follow_the_labelled_insert() {
        let registry = registry();
        let incoming = graph(&registry, json!([{"name": "#ref{p.name}"}, {"#id": "p", "name": "A"}]));
        let plan = plan(&registry, None, &incoming, &UpsertOptions::insert_graph()).unwrap();
        assert_eq!(kinds(&plan), vec!["insert Person #1", "insert Person #0"]);
        assert_eq!(plan.references.node_of("p"), Some(NodeId(1)));
    }

    #[test]
    fn test_unknown_template_label() {
        let registry = registry();
        let incoming = graph(&registry, json!({"name": "#ref{q.name}"}));
        let err = plan(&registry, None, &incoming, &UpsertOptions::insert_graph()).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnresolvedReference);
    }

    #[test]
    fn test_reference_cycle() {
        let registry = registry();
        let incoming = graph(
            &registry,
            json!([
                {"#id": "a", "parent": {"#ref": "b"}},
                {"#id": "b", "parent": {"#ref": "a"}}
            ]),
        );
        let err = plan(&registry, None, &incoming, &UpsertOptions::insert_graph()).unwrap_err();
        assert_eq!(err.code, ErrorCode::CyclicGraph);
        assert!(err.message.contains("Person"));
    }

    #[test]
    fn test_upsert_patch_and_delete() {
        let registry = registry();
        let existing = graph(&registry, json!({"id": 1, "pets": [{"id": 10, "name": "Old"}, {"id": 11, "name": "Gone"}]}));
        let incoming = graph(&registry, json!({"id": 1, "pets": [{"id": 10, "name": "Rex"}]}));
        let plan = plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();

        assert_eq!(kinds(&plan), vec![r#"patch Animal (10) {name: "Rex"}"#, "delete Animal (11)"]);
        assert_eq!(plan.state(NodeId(0)), Some(&NodeState::Unchanged));
        assert_eq!(plan.state(NodeId(1)), Some(&NodeState::Changed(vec!["name".into()])));
        assert_eq!(plan.states[&NodeRef::Existing(NodeId(2))], NodeState::Absent);
    }

    #[test]
    fn test_replanning_persisted_graph_is_empty() {
        let registry = registry();
        let value = json!({
            "id": 1,
            "parent_id": null,
            "parent": null,
            "pets": [{"id": 10, "owner_id": 1, "name": "Rex"}],
            "movies": [{"id": 5, "title": "M", "role": "lead"}]
        });
        let existing = graph(&registry, value.clone());
        let incoming = graph(&registry, value);
        let plan = plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
        assert!(plan.is_empty(), "{:?}", kinds(&plan));
    }

    #[test]
    fn test_no_delete_and_unrelate() {
        let registry = registry();
        let existing = graph(&registry, json!({"id": 1, "pets": [{"id": 10}], "movies": [{"id": 5}]}));
        let incoming = graph(&registry, json!({"id": 1, "pets": [], "movies": []}));

        let options = UpsertOptions::new().no_delete(["pets"]);
        let plan = plan(&registry, Some(&existing), &incoming, &options).unwrap();
        assert_eq!(kinds(&plan), vec!["unrelate Movie (5) from Person.movies"]);

        let options = UpsertOptions::new().unrelate(true);
        let plan = super::plan(&registry, Some(&existing), &incoming, &options).unwrap();
        assert_eq!(
            kinds(&plan),
            vec!["unrelate Animal (10) from Person.pets", "unrelate Movie (5) from Person.movies"]
        );
    }

    #[test]
    fn test_delete_cascades_to_owned_rows() {
        let registry = registry();
        let existing = graph(
            &registry,
            json!({"id": 1, "children": [{"id": 2, "pets": [{"id": 10}], "movies": [{"id": 5}]}]}),
        );
        let incoming = graph(&registry, json!({"id": 1, "children": []}));
        let plan = plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
        assert_eq!(
            kinds(&plan),
            vec!["delete Animal (10)", "unrelate Movie (5) from Person.movies", "delete Person (2)"]
        );
    }

    #[test]
    fn test_unknown_keyed_rows() {
        let registry = registry();
        let existing = graph(&registry, json!({"id": 1, "pets": []}));
        let incoming = graph(&registry, json!({"id": 1, "pets": [{"id": 99}], "movies": [{"id": 5, "role": "extra"}]}));

        let plan = plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
        assert_eq!(kinds(&plan), vec!["insert Animal #1", "relate Movie #2 to #0.movies"]);

        let options = UpsertOptions::new().relate(["pets"]);
        let plan = super::plan(&registry, Some(&existing), &incoming, &options).unwrap();
        assert_eq!(kinds(&plan), vec!["relate Animal #1 to #0.pets", "relate Movie #2 to #0.movies"]);

        let options = UpsertOptions::new().insert_missing(false);
        let err = super::plan(&registry, Some(&existing), &incoming, &options).unwrap_err();
        assert_eq!(err.code, ErrorCode::RecordNotFound);
        assert_eq!(err.context.identity.as_deref(), Some("(99)"));
    }

    #[test]
    fn test_no_update_and_no_insert() {
        let registry = registry();
        let existing = graph(&registry, json!({"id": 1, "name": "A", "pets": []}));
        let incoming = graph(&registry, json!({"id": 1, "name": "B", "pets": [{"name": "Rex"}]}));

        let options = UpsertOptions::new().no_update(true).no_insert(["pets"]);
        let plan = plan(&registry, Some(&existing), &incoming, &options).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.state(NodeId(0)), Some(&NodeState::Changed(vec!["name".into()])));
    }

    #[test]
    fn test_match_by_position() {
        let registry = registry();
        let existing = graph(&registry, json!({"id": 1, "pets": [{"id": 10, "name": "Old"}]}));
        let incoming = graph(&registry, json!({"id": 1, "pets": [{"name": "New"}]}));

        let plan = plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
        assert_eq!(kinds(&plan), vec!["insert Animal #1", "delete Animal (10)"]);

        let options = UpsertOptions::new().match_by_position(["pets"]);
        let plan = super::plan(&registry, Some(&existing), &incoming, &options).unwrap();
        assert_eq!(kinds(&plan), vec![r#"patch Animal (10) {name: "New"}"#]);
    }

    #[test]
    fn test_belongs_to_on_persisted_parent() {
        let registry = registry();
        let existing = graph(&registry, json!({"id": 1, "parent_id": 7, "parent": {"id": 7}}));

        let incoming = graph(&registry, json!({"id": 1, "parent": {"name": "New mom"}}));
        let plan = plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
        assert_eq!(kinds(&plan), vec!["insert Person #1", "relate Person #1 to #0.parent"]);

        let incoming = graph(&registry, json!({"id": 1, "parent": null}));
        let plan = super::plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
        assert_eq!(kinds(&plan), vec!["unrelate Person (7) from Person.parent"]);
    }

    #[test]
    fn test_templates_need_allow_refs_when_upserting() {
        let registry = registry();
        let existing = graph(&registry, json!({"id": 1, "name": "A"}));
        let incoming = graph(&registry, json!({"id": 1, "name": "#ref{x.name}"}));

        let plan = plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
        let Operation::Patch { changes, .. } = &plan.operations[0] else {
            panic!("expected patch");
        };
        assert_eq!(changes["name"], FieldSource::Value(json!("#ref{x.name}")));

        let options = UpsertOptions::new().allow_refs(true);
        let err = super::plan(&registry, Some(&existing), &incoming, &options).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnresolvedReference);
    }

    #[test]
    fn test_same_key_inserted_twice() {
        let registry = registry();
        let incoming = graph(&registry, json!([{"id": 5, "name": "a"}, {"id": 5, "name": "b"}]));
        let err = plan(&registry, None, &incoming, &UpsertOptions::insert_graph()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidGraph);
        assert_eq!(err.context.identity.as_deref(), Some("(5)"));

        let incoming = graph(&registry, json!([{"id": 5, "movies": [{"id": 7}]}, {"id": 6, "movies": [{"id": 7}]}]));
        let options = UpsertOptions::insert_graph().relate(["movies"]);
        assert!(plan(&registry, None, &incoming, &options).is_ok());
    }

    #[test]
    fn test_large_key_change_is_patched() {
        let registry = registry();
        let existing = graph(&registry, json!({"id": 1, "name": "A", "parent_id": 9_007_199_254_740_992_i64}));
        let incoming = graph(&registry, json!({"id": 1, "parent_id": 9_007_199_254_740_993_i64}));
        let plan = plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
        assert_eq!(kinds(&plan), vec!["patch Person (1) {parent_id: 9007199254740993}"]);
    }

    #[test]
    fn test_root_reference_is_rejected() {
        let registry = registry();
        let incoming = graph(&registry, json!([{"#id": "a"}, {"#ref": "a"}]));
        let err = plan(&registry, None, &incoming, &UpsertOptions::insert_graph()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidGraph);
    }
}
