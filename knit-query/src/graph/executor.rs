//! Execution of operation plans.
//!
//! Operations run one after another on a single [`Queryable`]; a failed
//! statement stops the run with the table and row it was writing. Nothing is
//! rolled back: wrap the call in a transaction for atomicity.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use knit_schema::model::{ModelRegistry, RelationKind};
use serde_json::Value;
use smol_str::SmolStr;
use tracing::{debug, warn};

use super::operation::{FieldSource, Operation, OperationPlan};
use super::refs::{ReferenceTable, has_references};
use super::{Graph, NodeId};
use crate::error::{QueryError, QueryResult};
use crate::filter::{Filter, FilterValue};
use crate::logging;
use crate::sql::{DatabaseType, SqlBuilder};
use crate::traits::Queryable;
use crate::value::{Record, key_values};

/// Observer of plan execution.
pub trait OperationHook: Send + Sync {
    /// Called before operation `index` runs.
    fn before_operation(&self, index: usize, operation: &Operation) {
        let _ = (index, operation);
    }

    /// Called after operation `index` succeeded.
    fn after_operation(&self, index: usize, operation: &Operation, elapsed: Duration) {
        let _ = (index, operation, elapsed);
    }

    /// Called when operation `index` failed; the run stops afterwards.
    fn on_error(&self, index: usize, operation: &Operation, error: &QueryError) {
        let _ = (index, operation, error);
    }
}

/// A shared hook.
pub type SharedHook = Arc<dyn OperationHook>;

/// Hooks called in registration order.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<SharedHook>,
}

impl HookChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook to the end of the chain.
    pub fn push<H: OperationHook + 'static>(&mut self, hook: H) {
        self.hooks.push(Arc::new(hook));
    }

    /// Add a shared hook to the end of the chain.
    pub fn push_shared(&mut self, hook: SharedHook) {
        self.hooks.push(hook);
    }

    /// Number of hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the chain has no hooks.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookChain").field("hooks", &self.hooks.len()).finish()
    }
}

impl OperationHook for HookChain {
    fn before_operation(&self, index: usize, operation: &Operation) {
        for hook in &self.hooks {
            hook.before_operation(index, operation);
        }
    }

    fn after_operation(&self, index: usize, operation: &Operation, elapsed: Duration) {
        for hook in &self.hooks {
            hook.after_operation(index, operation, elapsed);
        }
    }

    fn on_error(&self, index: usize, operation: &Operation, error: &QueryError) {
        for hook in &self.hooks {
            hook.on_error(index, operation, error);
        }
    }
}

/// Logs every operation through `tracing`.
///
/// ```rust
/// use std::time::Duration;
/// use knit_query::graph::executor::TracingHook;
///
/// let hook = TracingHook::new().with_slow_threshold(Duration::from_millis(50));
/// assert_eq!(hook.operation_count(), 0);
/// ```
#[derive(Debug)]
pub struct TracingHook {
    slow_threshold: Duration,
    operations: AtomicU64,
}

impl TracingHook {
    /// Create a hook warning about operations slower than one second.
    pub fn new() -> Self {
        Self {
            slow_threshold: Duration::from_secs(1),
            operations: AtomicU64::new(0),
        }
    }

    /// Warn about operations slower than `threshold`.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Operations completed so far.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }
}

impl Default for TracingHook {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationHook for TracingHook {
    fn before_operation(&self, index: usize, operation: &Operation) {
        debug!(target: "knit::graph", index, %operation, "Starting operation");
    }

    fn after_operation(&self, index: usize, operation: &Operation, elapsed: Duration) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let elapsed_us = elapsed.as_micros() as u64;
        if elapsed >= self.slow_threshold {
            warn!(target: "knit::graph", index, %operation, elapsed_us, "Slow operation detected");
        } else {
            debug!(target: "knit::graph", index, %operation, elapsed_us, "Operation completed");
        }
    }

    fn on_error(&self, index: usize, operation: &Operation, error: &QueryError) {
        warn!(target: "knit::graph", index, %operation, %error, "Operation failed");
    }
}

/// Runs operation plans against a database.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    registry: Arc<ModelRegistry>,
    db_type: DatabaseType,
    log_queries: bool,
    hooks: HookChain,
}

impl PlanExecutor {
    /// Create an executor with PostgreSQL placeholders and no hooks.
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            db_type: DatabaseType::default(),
            log_queries: false,
            hooks: HookChain::new(),
        }
    }

    /// Set the placeholder style.
    pub fn db_type(mut self, db_type: DatabaseType) -> Self {
        self.db_type = db_type;
        self
    }

    /// Log statements at `debug`.
    pub fn log_queries(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    /// Use `hooks` around every operation.
    pub fn hooks(mut self, hooks: HookChain) -> Self {
        self.hooks = hooks;
        self
    }

    /// Run `plan`, planned for `graph`, and return the graph's roots with
    /// generated values and nested relations.
    pub async fn execute(
        &self,
        db: &dyn Queryable,
        graph: &Graph,
        plan: &OperationPlan,
    ) -> QueryResult<Vec<Record>> {
        let mut run = Run::seed(&self.registry, graph, plan)?;
        debug!(model = graph.model(), operations = plan.len(), "executing graph plan");

        for (index, operation) in plan.iter().enumerate() {
            self.hooks.before_operation(index, operation);
            let started = Instant::now();
            match self.apply(db, &mut run, operation).await {
                Ok(()) => self.hooks.after_operation(index, operation, started.elapsed()),
                Err(e) => {
                    let mut e = e.with_context(operation.to_string());
                    if e.context.model.is_none() {
                        e = e.with_model(operation.model());
                    }
                    if let Some(identity) = operation.identity() {
                        e = e.with_identity(identity.to_string());
                    }
                    self.hooks.on_error(index, operation, &e);
                    return Err(e);
                }
            }
        }

        Ok(run.materialize())
    }

    async fn apply(&self, db: &dyn Queryable, run: &mut Run<'_>, operation: &Operation) -> QueryResult<()> {
        match operation {
            Operation::Insert { model, node, fields, .. } => {
                let descriptor = self.registry.model(model)?;
                let values = run.resolve_all(fields)?;
                let (sql, params) = self.insert(&descriptor.table, &values, true);
                let row = self
                    .statement(db, &descriptor.table, sql, params)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        QueryError::unexpected_result("INSERT ... RETURNING produced no row")
                            .with_table(descriptor.table.as_str())
                    })?;

                if let Some(label) = &run.graph.node(*node).id_label {
                    let exposed = reference_values(run.graph, *node, &descriptor.id_columns, Some(&row));
                    run.refs.set_resolved(label, exposed)?;
                }
                let mut record: Record = values.into_iter().collect();
                record.extend(row);
                run.store.insert(*node, record);
            }

            Operation::Patch { model, node, key, changes, .. } => {
                let descriptor = self.registry.model(model)?;
                let values = run.resolve_all(changes)?;
                let key = key_of(key, &descriptor.id_columns, model)?;
                let (sql, params) = self.update(&descriptor.table, &values, &descriptor.id_columns, &key);
                self.statement(db, &descriptor.table, sql, params).await?;
                run.store.entry(*node).or_default().extend(values);
            }

            Operation::Delete { model, key, .. } => {
                let descriptor = self.registry.model(model)?;
                let key = key_of(key, &descriptor.id_columns, model)?;
                let mut builder = SqlBuilder::new(self.db_type);
                builder.push("DELETE FROM ").push_identifier(&descriptor.table).push(" WHERE ");
                Filter::key_equals(&descriptor.id_columns, &key).write_sql(&mut builder, None);
                let (sql, params) = builder.build();
                self.statement(db, &descriptor.table, sql, params).await?;
            }

            Operation::Relate { node, parent, through_data, .. } => {
                let owner_model = &run.graph.node(parent.node).model;
                let relation = self.registry.relation(owner_model, &parent.relation)?;
                match relation.kind {
                    RelationKind::ManyToMany => {
                        let through = relation.through.as_ref().ok_or_else(|| {
                            QueryError::internal(format!("relation {} has no join table", relation.name))
                        })?;
                        let mut values = Vec::new();
                        for (column, owner) in through.owner_columns.iter().zip(&relation.owner_columns) {
                            values.push((column.to_string(), run.column(parent.node, owner)?));
                        }
                        for (column, related) in through.related_columns.iter().zip(&relation.related_columns) {
                            values.push((column.to_string(), run.column(*node, related)?));
                        }
                        values.extend(run.resolve_all(through_data)?);
                        let (sql, params) = self.insert(&through.table, &values, false);
                        self.statement(db, &through.table, sql, params).await?;
                    }
                    RelationKind::HasOne | RelationKind::HasMany => {
                        let related = self.registry.model(&relation.related_model)?;
                        let mut values = Vec::new();
                        for (column, owner) in relation.related_columns.iter().zip(&relation.owner_columns) {
                            values.push((column.to_string(), run.column(parent.node, owner)?));
                        }
                        let key = run.key(*node, &related.id_columns, &related.name)?;
                        let (sql, params) = self.update(&related.table, &values, &related.id_columns, &key);
                        self.statement(db, &related.table, sql, params).await?;
                        run.store.entry(*node).or_default().extend(values);
                    }
                    RelationKind::BelongsToOne => {
                        let owner = self.registry.model(owner_model)?;
                        let mut values = Vec::new();
                        for (column, related) in relation.owner_columns.iter().zip(&relation.related_columns) {
                            values.push((column.to_string(), run.column(*node, related)?));
                        }
                        let key = run.key(parent.node, &owner.id_columns, &owner.name)?;
                        let (sql, params) = self.update(&owner.table, &values, &owner.id_columns, &key);
                        self.statement(db, &owner.table, sql, params).await?;
                        run.store.entry(parent.node).or_default().extend(values);
                    }
                }
            }

            Operation::Unrelate { values, parent, .. } => {
                let relation = self.registry.relation(&parent.model, &parent.relation)?;
                match relation.kind {
                    RelationKind::ManyToMany => {
                        let through = relation.through.as_ref().ok_or_else(|| {
                            QueryError::internal(format!("relation {} has no join table", relation.name))
                        })?;
                        let owner_key = key_of(&parent.values, &relation.owner_columns, &parent.model)?;
                        let related_key = key_of(values, &relation.related_columns, &relation.related_model)?;
                        let mut builder = SqlBuilder::new(self.db_type);
                        builder.push("DELETE FROM ").push_identifier(&through.table).push(" WHERE ");
                        Filter::and([
                            Filter::key_equals(&through.owner_columns, &owner_key),
                            Filter::key_equals(&through.related_columns, &related_key),
                        ])
                        .write_sql(&mut builder, None);
                        let (sql, params) = builder.build();
                        self.statement(db, &through.table, sql, params).await?;
                    }
                    RelationKind::HasOne | RelationKind::HasMany => {
                        let related = self.registry.model(&relation.related_model)?;
                        let cleared = nulls(&relation.related_columns);
                        let key = key_of(values, &related.id_columns, &related.name)?;
                        let (sql, params) = self.update(&related.table, &cleared, &related.id_columns, &key);
                        self.statement(db, &related.table, sql, params).await?;
                    }
                    RelationKind::BelongsToOne => {
                        let owner = self.registry.model(&parent.model)?;
                        let cleared = nulls(&relation.owner_columns);
                        let key = key_of(&parent.values, &owner.id_columns, &owner.name)?;
                        let (sql, params) = self.update(&owner.table, &cleared, &owner.id_columns, &key);
                        self.statement(db, &owner.table, sql, params).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn statement(
        &self,
        db: &dyn Queryable,
        table: &str,
        sql: String,
        params: Vec<FilterValue>,
    ) -> QueryResult<Vec<Record>> {
        logging::log_statement(self.log_queries, &sql, params.len());
        db.run_query(&sql, params)
            .await
            .map_err(|e| e.with_table(table).with_sql(sql))
    }

    fn insert(&self, table: &str, values: &[(String, Value)], returning: bool) -> (String, Vec<FilterValue>) {
        let mut builder = SqlBuilder::new(self.db_type);
        builder.push("INSERT INTO ").push_identifier(table);
        if values.is_empty() {
            builder.push(" DEFAULT VALUES");
        } else {
            builder.push(" (");
            for (i, (column, _)) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push_identifier(column);
            }
            builder.push(") VALUES (");
            for (i, (_, value)) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push_param(value);
            }
            builder.push(")");
        }
        if returning {
            builder.push(" RETURNING *");
        }
        builder.build()
    }

    fn update(
        &self,
        table: &str,
        values: &[(String, Value)],
        key_columns: &[SmolStr],
        key: &[FilterValue],
    ) -> (String, Vec<FilterValue>) {
        let mut builder = SqlBuilder::new(self.db_type);
        builder.push("UPDATE ").push_identifier(table).push(" SET ");
        for (i, (column, value)) in values.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push_identifier(column).push(" = ").push_param(value);
        }
        builder.push(" WHERE ");
        Filter::key_equals(key_columns, key).write_sql(&mut builder, None);
        builder.build()
    }
}

/// Values of one execution run.
struct Run<'g> {
    graph: &'g Graph,
    store: HashMap<NodeId, Record>,
    refs: ReferenceTable,
}

impl<'g> Run<'g> {
    /// Seed the store with persisted rows overlaid by literal input, and
    /// resolve the labels of nodes that are not inserted.
    fn seed(registry: &ModelRegistry, graph: &'g Graph, plan: &OperationPlan) -> QueryResult<Self> {
        let mut store = HashMap::new();
        for (&node, seed) in &plan.seeds {
            let mut record = seed.clone();
            record.extend(literals(graph, node));
            store.insert(node, record);
        }

        let mut refs = plan.references.clone();
        let inserted: HashSet<NodeId> = plan
            .iter()
            .filter_map(|op| match op {
                Operation::Insert { node, .. } => Some(*node),
                _ => None,
            })
            .collect();
        for node in graph.nodes() {
            let Some(label) = &node.id_label else {
                continue;
            };
            if inserted.contains(&node.id) {
                continue;
            }
            let id_columns = &registry.model(&node.model)?.id_columns;
            let values = reference_values(graph, node.id, id_columns, store.get(&node.id));
            refs.set_resolved(label, values)?;
        }

        Ok(Self { graph, store, refs })
    }

    fn resolve(&self, source: &FieldSource) -> QueryResult<Value> {
        match source {
            FieldSource::Value(value) => Ok(value.clone()),
            FieldSource::Template(value) => self.refs.substitute(value),
            FieldSource::Column { node, column } => self.column(*node, column),
        }
    }

    fn resolve_all(&self, fields: &IndexMap<String, FieldSource>) -> QueryResult<Vec<(String, Value)>> {
        fields
            .iter()
            .map(|(column, source)| Ok((column.clone(), self.resolve(source)?)))
            .collect()
    }

    fn column(&self, node: NodeId, column: &str) -> QueryResult<Value> {
        self.store
            .get(&node)
            .and_then(|record| record.get(column))
            .or_else(|| self.graph.node(node).data.get(column).filter(|v| !has_references(v)))
            .cloned()
            .ok_or_else(|| {
                QueryError::unexpected_result(format!("value of `{column}` of node {node} is not known"))
                    .with_model(self.graph.node(node).model.as_str())
                    .with_field(column)
            })
    }

    fn key(&self, node: NodeId, columns: &[SmolStr], model: &str) -> QueryResult<Vec<FilterValue>> {
        let key = columns
            .iter()
            .map(|column| self.column(node, column).map(FilterValue::from))
            .collect::<QueryResult<Vec<_>>>()?;
        if key.iter().any(FilterValue::is_null) {
            return Err(missing_key(model));
        }
        Ok(key)
    }

    fn materialize(&self) -> Vec<Record> {
        self.graph.roots().iter().map(|&root| self.record_of(root)).collect()
    }

    fn record_of(&self, id: NodeId) -> Record {
        let node = self.graph.node(id);
        let target = node
            .ref_label
            .as_deref()
            .and_then(|label| self.refs.node_of(label))
            .unwrap_or(id);
        let mut record = self
            .store
            .get(&target)
            .cloned()
            .unwrap_or_else(|| self.graph.node(target).record());

        for (name, slot) in &node.relations {
            let value = if slot.kind.is_many() {
                Value::Array(slot.nodes.iter().map(|&n| Value::Object(self.record_of(n))).collect())
            } else {
                slot.nodes
                    .first()
                    .map(|&n| Value::Object(self.record_of(n)))
                    .unwrap_or(Value::Null)
            };
            record.insert(name.to_string(), value);
        }
        record
    }
}

/// Literal (template-free) fields of a node.
fn literals(graph: &Graph, node: NodeId) -> impl Iterator<Item = (String, Value)> + '_ {
    graph
        .node(node)
        .data
        .iter()
        .filter(|(_, v)| !has_references(v))
        .map(|(k, v)| (k.clone(), v.clone()))
}

/// Values a `#ref{label.field}` may read: the node's literal fields plus its
/// id columns taken from the written or persisted row.
fn reference_values(graph: &Graph, node: NodeId, id_columns: &[SmolStr], row: Option<&Record>) -> Record {
    let mut values: Record = literals(graph, node).collect();
    if let Some(row) = row {
        for column in id_columns {
            if let Some(value) = row.get(column.as_str()) {
                values.insert(column.to_string(), value.clone());
            }
        }
    }
    values
}

fn key_of(record: &Record, columns: &[SmolStr], model: &str) -> QueryResult<Vec<FilterValue>> {
    key_values(record, columns).ok_or_else(|| missing_key(model))
}

fn missing_key(model: &str) -> QueryError {
    QueryError::unexpected_result(format!("{model} row has no complete key")).with_model(model)
}

fn nulls(columns: &[SmolStr]) -> Vec<(String, Value)> {
    columns.iter().map(|c| (c.to_string(), Value::Null)).collect()
}
