//! One entry point for eager loading and graph writes.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use knit_query::prelude::*;
//! use serde_json::json;
//!
//! # async fn run(db: &dyn Queryable, registry: Arc<ModelRegistry>) -> QueryResult<()> {
//! let engine = GraphEngine::new(registry).hook(TracingHook::new());
//!
//! let people = engine
//!     .insert_graph(db, "Person", &json!({
//!         "name": "Jennifer",
//!         "pets": [{ "name": "Fluffy" }],
//!     }))
//!     .await?;
//!
//! let id = people[0]["id"].clone();
//! let loaded = engine.fetch_graph(db, "Person", &[id], "pets").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use knit_schema::model::ModelRegistry;
use knit_schema::{EagerStrategy, IntoRelationExpression, KnitConfig};
use serde_json::Value;
use smol_str::SmolStr;
use tracing::info;

use crate::eager::{EagerOptions, EagerResolver};
use crate::error::QueryResult;
use crate::graph::executor::{HookChain, OperationHook, PlanExecutor};
use crate::graph::operation::OperationPlan;
use crate::graph::options::UpsertOptions;
use crate::graph::{Graph, GraphNode, planner};
use crate::modifier::ModifierRegistry;
use crate::traits::Queryable;
use crate::value::Record;

/// Eager loading, graph inserts and graph upserts over one model registry.
#[derive(Debug, Clone)]
pub struct GraphEngine {
    registry: Arc<ModelRegistry>,
    modifiers: ModifierRegistry,
    hooks: HookChain,
    eager_options: EagerOptions,
    upsert_options: UpsertOptions,
    resolver: EagerResolver,
    executor: PlanExecutor,
}

impl GraphEngine {
    /// Create an engine with default settings.
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        let eager_options = EagerOptions::default();
        Self {
            resolver: EagerResolver::with_options(registry.clone(), eager_options.clone()),
            executor: PlanExecutor::new(registry.clone()),
            registry,
            modifiers: ModifierRegistry::new(),
            hooks: HookChain::new(),
            eager_options,
            upsert_options: UpsertOptions::default(),
        }
    }

    /// Take eager, upsert and debug settings from `config`.
    pub fn config(mut self, config: &KnitConfig) -> Self {
        self.eager_options = EagerOptions::from(config);
        self.upsert_options = UpsertOptions::from(&config.upsert);
        self.rebuild()
    }

    /// Resolve modifier names with `modifiers`.
    pub fn modifiers(mut self, modifiers: ModifierRegistry) -> Self {
        self.modifiers = modifiers;
        self.rebuild()
    }

    /// Call `hook` around every graph write.
    pub fn hook<H: OperationHook + 'static>(mut self, hook: H) -> Self {
        self.hooks.push(hook);
        self.rebuild()
    }

    fn rebuild(mut self) -> Self {
        self.resolver = EagerResolver::with_options(self.registry.clone(), self.eager_options.clone())
            .modifiers(self.modifiers.clone());
        self.executor = PlanExecutor::new(self.registry.clone())
            .db_type(self.eager_options.db_type)
            .log_queries(self.eager_options.log_queries)
            .hooks(self.hooks.clone());
        self
    }

    /// The model registry.
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The modifier registry.
    pub fn modifier_registry(&self) -> &ModifierRegistry {
        &self.modifiers
    }

    /// Upsert options used when the caller passes none.
    pub fn default_upsert_options(&self) -> &UpsertOptions {
        &self.upsert_options
    }

    /// The eager resolver.
    pub fn resolver(&self) -> &EagerResolver {
        &self.resolver
    }

    /// Load `expr` onto rows of `model` that are already loaded.
    pub async fn eager(
        &self,
        db: &dyn Queryable,
        model: &str,
        rows: Vec<Record>,
        expr: impl IntoRelationExpression,
        strategy: EagerStrategy,
    ) -> QueryResult<Vec<Record>> {
        let expr = expr.into_relation_expression()?;
        self.resolver.resolve_with(db, model, rows, &expr, strategy).await
    }

    /// Load rows of `model` by primary key together with `expr`.
    pub async fn fetch_graph(
        &self,
        db: &dyn Queryable,
        model: &str,
        ids: &[Value],
        expr: impl IntoRelationExpression,
    ) -> QueryResult<Vec<Record>> {
        let expr = expr.into_relation_expression()?;
        self.resolver
            .fetch(db, model, ids, &expr, self.eager_options.strategy)
            .await
    }

    /// Plan the insert of `value` without writing.
    pub fn plan_insert_graph(&self, model: &str, value: &Value) -> QueryResult<OperationPlan> {
        self.prepare_insert(model, value).map(|(_, plan)| plan)
    }

    /// Insert `value`, an object or an array of objects, with all nested rows.
    ///
    /// Returns the roots with generated keys and nested relations.
    pub async fn insert_graph(&self, db: &dyn Queryable, model: &str, value: &Value) -> QueryResult<Vec<Record>> {
        let (graph, plan) = self.prepare_insert(model, value)?;
        info!(model, operations = plan.len(), "inserting graph");
        self.executor.execute(db, &graph, &plan).await
    }

    /// Plan the upsert of `value` without writing. Reads the persisted graph.
    pub async fn plan_upsert_graph(
        &self,
        db: &dyn Queryable,
        model: &str,
        value: &Value,
        options: Option<&UpsertOptions>,
    ) -> QueryResult<OperationPlan> {
        self.prepare_upsert(db, model, value, options).await.map(|(_, plan)| plan)
    }

    /// Make the stored graph rooted at the rows of `value` look like `value`.
    ///
    /// Only relations present in `value` are touched. `options` default to
    /// the engine's configured upsert options.
    pub async fn upsert_graph(
        &self,
        db: &dyn Queryable,
        model: &str,
        value: &Value,
        options: Option<&UpsertOptions>,
    ) -> QueryResult<Vec<Record>> {
        let (graph, plan) = self.prepare_upsert(db, model, value, options).await?;
        info!(model, operations = plan.len(), summary = ?plan.summary(), "upserting graph");
        self.executor.execute(db, &graph, &plan).await
    }

    fn prepare_insert(&self, model: &str, value: &Value) -> QueryResult<(Graph, OperationPlan)> {
        let graph = Graph::from_json(&self.registry, model, value)?;
        let plan = planner::plan(&self.registry, None, &graph, &UpsertOptions::insert_graph())?;
        Ok((graph, plan))
    }

    async fn prepare_upsert(
        &self,
        db: &dyn Queryable,
        model: &str,
        value: &Value,
        options: Option<&UpsertOptions>,
    ) -> QueryResult<(Graph, OperationPlan)> {
        let options = options.unwrap_or(&self.upsert_options);
        let incoming = Graph::from_json(&self.registry, model, value)?;
        let id_columns = &self.registry.model(model)?.id_columns;

        let ids: Vec<Value> = incoming
            .roots()
            .iter()
            .filter_map(|&root| root_id(incoming.node(root), id_columns))
            .collect();
        let expr = incoming.relation_expression();
        crate::knit_debug!(model, roots = ids.len(), expression = %expr, "loading persisted graph");

        let rows = if ids.is_empty() {
            Vec::new()
        } else {
            self.resolver
                .fetch(db, model, &ids, &expr, self.eager_options.strategy)
                .await?
        };
        let existing = Graph::from_records(&self.registry, model, &rows)?;

        let plan = planner::plan(&self.registry, Some(&existing), &incoming, options)?;
        Ok((incoming, plan))
    }
}

/// Primary key of a root as accepted by [`EagerResolver::fetch`].
fn root_id(node: &GraphNode, columns: &[SmolStr]) -> Option<Value> {
    let mut values = columns
        .iter()
        .map(|c| node.data.get(c.as_str()).filter(|v| !v.is_null()).cloned())
        .collect::<Option<Vec<_>>>()?;
    match values.len() {
        1 => values.pop(),
        _ => Some(Value::Array(values)),
    }
}
