//! Eager loading of relation expressions onto already loaded rows.
//!
//! Two strategies produce the same trees:
//!
//! - [`EagerStrategy::Naive`]: one batched `WHERE key IN (...)` query per
//!   relation and level, siblings fetched concurrently.
//! - [`EagerStrategy::Join`]: one statement of nested `LEFT JOIN`s whose flat
//!   rows are folded back into trees.
//!
//! To-one relations attach an object or `null`, to-many relations an array.

mod join;
mod naive;

use std::borrow::Cow;
use std::sync::Arc;

use knit_schema::expr::Recursion;
use knit_schema::model::{ModelDescriptor, ModelRegistry, RelationDescriptor, RelationKind};
use knit_schema::{EagerStrategy, KnitConfig, RelationExpression};
use serde_json::Value;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::concurrent::{ConcurrencyConfig, ConcurrentExecutor};
use crate::error::{QueryError, QueryResult};
use crate::filter::{Filter, FilterValue};
use crate::logging;
use crate::modifier::{ModifierRegistry, RelationQuery};
use crate::sql::{DatabaseType, SqlBuilder, escape_identifier, qualified};
use crate::traits::Queryable;
use crate::value::{IdentityKey, Record, key_values};

/// Column prefix reserved for join-table columns in generated statements.
pub(crate) const THROUGH_PREFIX: &str = "$through";

/// Column reserved for the per-parent row number of a limited relation.
pub(crate) const RANK_COLUMN: &str = "$rank";

const RANKED_ALIAS: &str = "$ranked";

/// Eager loading settings.
#[derive(Debug, Clone)]
pub struct EagerOptions {
    /// Strategy used by [`EagerResolver::resolve`].
    pub strategy: EagerStrategy,
    /// Maximum concurrent statements.
    pub concurrency: usize,
    /// Maximum keys per `IN (...)` list.
    pub batch_size: usize,
    /// Levels an infinite recursion is followed.
    pub max_recursion_depth: u32,
    /// Placeholder style.
    pub db_type: DatabaseType,
    /// Log statements at `debug` instead of `trace`.
    pub log_queries: bool,
}

impl Default for EagerOptions {
    fn default() -> Self {
        Self::from(&KnitConfig::default())
    }
}

impl From<&KnitConfig> for EagerOptions {
    fn from(config: &KnitConfig) -> Self {
        Self {
            strategy: config.eager.strategy,
            concurrency: config.eager.concurrency,
            batch_size: config.eager.batch_size,
            max_recursion_depth: config.eager.max_recursion_depth,
            db_type: config.database.dialect.into(),
            log_queries: config.debug.log_queries,
        }
    }
}

/// Resolves relation expressions against a [`Queryable`].
#[derive(Debug, Clone)]
pub struct EagerResolver {
    registry: Arc<ModelRegistry>,
    modifiers: ModifierRegistry,
    options: EagerOptions,
    executor: ConcurrentExecutor,
}

impl EagerResolver {
    /// Create a resolver with default options.
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self::with_options(registry, EagerOptions::default())
    }

    /// Create a resolver with explicit options.
    pub fn with_options(registry: Arc<ModelRegistry>, options: EagerOptions) -> Self {
        let executor = ConcurrentExecutor::new(
            ConcurrencyConfig::default().with_max_concurrency(options.concurrency),
        );
        Self {
            registry,
            modifiers: ModifierRegistry::new(),
            options,
            executor,
        }
    }

    /// Use `modifiers` to resolve modifier names.
    pub fn modifiers(mut self, modifiers: ModifierRegistry) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// The options in use.
    pub fn options(&self) -> &EagerOptions {
        &self.options
    }

    /// The model registry.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Load `expr` onto `rows` of `model` with the configured strategy.
    pub async fn resolve(
        &self,
        db: &dyn Queryable,
        model: &str,
        rows: Vec<Record>,
        expr: &RelationExpression,
    ) -> QueryResult<Vec<Record>> {
        self.resolve_with(db, model, rows, expr, self.options.strategy).await
    }

    /// Load `expr` onto `rows` of `model` with `strategy`.
    pub async fn resolve_with(
        &self,
        db: &dyn Queryable,
        model: &str,
        rows: Vec<Record>,
        expr: &RelationExpression,
        strategy: EagerStrategy,
    ) -> QueryResult<Vec<Record>> {
        expr.bind(&self.registry, model)?;
        self.check_modifiers(model, expr)?;

        if expr.is_empty() || rows.is_empty() {
            return Ok(rows);
        }

        debug!(model, expression = %expr, ?strategy, rows = rows.len(), "eager loading");
        match strategy {
            EagerStrategy::Naive => naive::resolve(self, db, model, rows, expr).await,
            EagerStrategy::Join => join::resolve(self, db, model, rows, expr).await,
        }
    }

    /// Load rows of `model` by primary key, then `expr` onto them.
    ///
    /// Ids are scalars for single-column keys and arrays for composite keys.
    /// Rows come back in database order; missing ids are skipped.
    pub async fn fetch(
        &self,
        db: &dyn Queryable,
        model: &str,
        ids: &[Value],
        expr: &RelationExpression,
        strategy: EagerStrategy,
    ) -> QueryResult<Vec<Record>> {
        let descriptor = self.registry.model(model)?;
        let keys = ids
            .iter()
            .map(|id| id_key(descriptor, id))
            .collect::<QueryResult<Vec<_>>>()?;

        let statements: Vec<_> = keys
            .chunks(self.options.batch_size.max(1))
            .map(|chunk| {
                let mut builder = SqlBuilder::new(self.options.db_type);
                builder.push("SELECT * FROM ").push_identifier(&descriptor.table).push(" WHERE ");
                Filter::keys_in(&descriptor.id_columns, chunk.to_vec()).write_sql(&mut builder, None);
                builder.build()
            })
            .collect();

        let batches = self
            .executor
            .join_ordered(statements.into_iter().map(|(sql, params)| self.run(db, sql, params)))
            .await?;
        let rows: Vec<Record> = batches.into_iter().flatten().collect();

        self.resolve_with(db, model, rows, expr, strategy).await
    }

    pub(crate) async fn run(
        &self,
        db: &dyn Queryable,
        sql: String,
        params: Vec<FilterValue>,
    ) -> QueryResult<Vec<Record>> {
        logging::log_statement(self.options.log_queries, &sql, params.len());
        self.executor
            .limited(db.run_query(&sql, params))
            .await
            .map_err(|e| e.with_sql(sql))
    }

    /// Query adjustments for one relation node: default modifier first.
    pub(crate) fn relation_query(
        &self,
        relation: &RelationDescriptor,
        node: &RelationExpression,
    ) -> QueryResult<RelationQuery> {
        self.modifiers
            .build(
                relation.default_modifier.as_deref(),
                node.modifiers().iter().map(|m| m.name.as_str()),
            )
            .map_err(|e| e.with_model(relation.related_model.as_str()))
    }

    /// Children loaded below rows of `node`, which sits `depth` levels deep.
    ///
    /// An infinite recursion stops expanding at `max_recursion_depth`.
    pub(crate) fn child_nodes<'n>(
        &self,
        node: &'n RelationExpression,
        depth: u32,
    ) -> Vec<Cow<'n, RelationExpression>> {
        if node.recursion() == Some(Recursion::Infinite) && depth >= self.options.max_recursion_depth {
            warn!(
                relation = node.alias(),
                max_depth = self.options.max_recursion_depth,
                "infinite recursion truncated"
            );
            return node.children().map(Cow::Borrowed).collect();
        }
        node.expanded_children()
    }

    fn check_modifiers(&self, model: &str, expr: &RelationExpression) -> QueryResult<()> {
        for child in expr.children() {
            let relation = self.relation(model, child)?;
            self.relation_query(relation, child)?;
            self.check_modifiers(&relation.related_model, child)?;
        }
        Ok(())
    }

    pub(crate) fn relation(
        &self,
        model: &str,
        node: &RelationExpression,
    ) -> QueryResult<&RelationDescriptor> {
        let name = node.relation_name().unwrap_or(node.alias());
        Ok(self.registry.relation(model, name)?)
    }
}

/// Columns a relation's rows must carry: the related model's key, the join
/// columns, and the owner columns of relations loaded below them.
pub(crate) fn required_columns(
    registry: &ModelRegistry,
    related: &ModelDescriptor,
    relation: &RelationDescriptor,
    children: &[Cow<'_, RelationExpression>],
) -> QueryResult<Vec<SmolStr>> {
    let mut columns: Vec<SmolStr> = related.id_columns.clone();
    let mut push = |column: &SmolStr| {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    };
    relation.related_columns.iter().for_each(&mut push);
    for child in children {
        let name = child.relation_name().unwrap_or(child.alias());
        let child_relation = registry.relation(&related.name, name)?;
        child_relation.owner_columns.iter().for_each(&mut push);
    }
    Ok(columns)
}

/// Value attached for a relation with no rows.
pub(crate) fn empty_relation(kind: RelationKind) -> Value {
    if kind.is_many() { Value::Array(Vec::new()) } else { Value::Null }
}

/// Value attached for a relation with `rows`.
pub(crate) fn relation_value(kind: RelationKind, rows: Vec<Record>) -> Value {
    if kind.is_many() {
        Value::Array(rows.into_iter().map(Value::Object).collect())
    } else {
        rows.into_iter().next().map(Value::Object).unwrap_or(Value::Null)
    }
}

/// Distinct non-null keys of `rows` over `columns`, in first-seen order.
pub(crate) fn distinct_keys(rows: &[Record], columns: &[SmolStr]) -> Vec<Vec<FilterValue>> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .filter_map(|row| {
            let identity = IdentityKey::from_record(row, columns)?;
            if !seen.insert(identity) {
                return None;
            }
            key_values(row, columns)
        })
        .collect()
}

/// Alias of a join-table column in generated statements.
pub(crate) fn through_alias(column: &str) -> String {
    format!("{THROUGH_PREFIX}:{column}")
}

/// Write the `SELECT` loading the rows of `relation` from `table`.
///
/// Join-table columns, extras included, come back under [`through_alias`].
/// With `keys` only rows of those parents are read. A `limit` keeps that many
/// rows per parent: rows are numbered per parent in [`RANK_COLUMN`] and
/// filtered on it.
pub(crate) fn write_relation_select(
    builder: &mut SqlBuilder,
    relation: &RelationDescriptor,
    table: &str,
    columns: &str,
    query: &RelationQuery,
    keys: Option<Vec<Vec<FilterValue>>>,
) -> QueryResult<()> {
    if relation.kind == RelationKind::ManyToMany && relation.through.is_none() {
        return Err(QueryError::internal(format!(
            "many-to-many relation `{}` has no through table",
            relation.name
        )));
    }

    if query.limit.is_some() {
        builder.push("SELECT * FROM (");
    }
    builder.push("SELECT ").push(columns);

    let (parent_columns, parent_table) = match &relation.through {
        Some(through) => {
            for column in through.owner_columns.iter().chain(&through.extra) {
                builder
                    .push(", ")
                    .push(qualified(&through.table, column))
                    .push(" AS ")
                    .push(escape_identifier(&through_alias(column)));
            }
            (&through.owner_columns, through.table.as_str())
        }
        None => (&relation.related_columns, table),
    };

    if query.limit.is_some() {
        let partition: Vec<String> = parent_columns.iter().map(|c| qualified(parent_table, c)).collect();
        builder.push(", ROW_NUMBER() OVER (PARTITION BY ").push(partition.join(", "));
        if !query.order_by.is_empty() {
            let mut order = String::from(" ORDER BY ");
            query.order_by.write_sql(&mut order, Some(table));
            builder.push(order);
        }
        builder.push(") AS ").push(escape_identifier(RANK_COLUMN));
    }

    builder.push(" FROM ").push_identifier(table);
    if let Some(through) = &relation.through {
        builder.push(" INNER JOIN ").push_identifier(&through.table).push(" ON ");
        for (i, (through_column, column)) in through.related_columns.iter().zip(&relation.related_columns).enumerate() {
            if i > 0 {
                builder.push(" AND ");
            }
            builder
                .push(qualified(&through.table, through_column))
                .push(" = ")
                .push(qualified(table, column));
        }
    }

    match keys {
        Some(keys) => {
            builder.push(" WHERE ");
            Filter::keys_in(parent_columns, keys).write_sql(builder, Some(parent_table));
            if !query.filter.is_none() {
                builder.push(" AND (");
                query.filter.write_sql(builder, Some(table));
                builder.push(")");
            }
        }
        None if !query.filter.is_none() => {
            builder.push(" WHERE ");
            query.filter.write_sql(builder, Some(table));
        }
        None => {}
    }

    match query.limit {
        Some(limit) => {
            let rank = qualified(RANKED_ALIAS, RANK_COLUMN);
            builder
                .push(") AS ")
                .push_identifier(RANKED_ALIAS)
                .push(format!(" WHERE {rank} <= {limit} ORDER BY {rank}"));
        }
        None if !query.order_by.is_empty() => {
            let mut order = String::from(" ORDER BY ");
            query.order_by.write_sql(&mut order, Some(table));
            builder.push(order);
        }
        None => {}
    }
    Ok(())
}

fn id_key(model: &ModelDescriptor, id: &Value) -> QueryResult<Vec<FilterValue>> {
    let invalid = || {
        QueryError::invalid_parameter(
            "ids",
            format!("{id} is not a key of `{}` ({} columns)", model.name, model.id_columns.len()),
        )
    };
    match (id, model.id_columns.len()) {
        (Value::Null | Value::Object(_), _) => Err(invalid()),
        (Value::Array(parts), n) if parts.len() == n && parts.iter().all(|p| !p.is_null()) => {
            Ok(parts.iter().map(FilterValue::from).collect())
        }
        (Value::Array(_), _) => Err(invalid()),
        (scalar, 1) => Ok(vec![FilterValue::from(scalar)]),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knit_schema::model::ModelDescriptor;
    use serde_json::json;

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::builder()
                .model(
                    ModelDescriptor::new("Person", "persons")
                        .relation(RelationDescriptor::has_many("children", "Person").related(["parent_id"]))
                        .relation(RelationDescriptor::has_many("pets", "Animal").related(["owner_id"])),
                )
                .model(
                    ModelDescriptor::new("Animal", "animals")
                        .relation(RelationDescriptor::belongs_to_one("owner", "Person").owner(["owner_id"])),
                )
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_required_columns() {
        let registry = registry();
        let animal = registry.model("Animal").unwrap();
        let pets = registry.relation("Person", "pets").unwrap();
        let node = RelationExpression::relation("pets").with_child(RelationExpression::relation("owner"));
        let children: Vec<_> = node.children().map(Cow::Borrowed).collect();

        let columns = required_columns(&registry, animal, pets, &children).unwrap();
        assert_eq!(columns, vec!["id", "owner_id"]);
    }

    #[test]
    fn test_distinct_keys_skips_nulls_and_duplicates() {
        let rows: Vec<Record> = [json!({"id": 1}), json!({"id": "1"}), json!({"id": null}), json!({"id": 2})]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        let keys = distinct_keys(&rows, &[SmolStr::new("id")]);
        assert_eq!(keys, vec![vec![FilterValue::Int(1)], vec![FilterValue::Int(2)]]);
    }

    #[test]
    fn test_relation_values() {
        assert_eq!(empty_relation(RelationKind::HasMany), json!([]));
        assert_eq!(empty_relation(RelationKind::BelongsToOne), Value::Null);
        let row = json!({"id": 1}).as_object().cloned().unwrap();
        assert_eq!(relation_value(RelationKind::HasOne, vec![row]), json!({"id": 1}));
    }

    #[test]
    fn test_child_nodes_truncates_infinite_recursion() {
        let options = EagerOptions {
            max_recursion_depth: 2,
            ..EagerOptions::default()
        };
        let resolver = EagerResolver::with_options(registry(), options);
        let node = RelationExpression::relation("children").with_recursion(Recursion::Infinite);

        assert_eq!(resolver.child_nodes(&node, 1).len(), 1);
        assert!(resolver.child_nodes(&node, 2).is_empty());
    }

    #[test]
    fn test_unknown_modifier_rejected_before_queries() {
        let resolver = EagerResolver::new(registry());
        let expr = knit_schema::parse_expression("pets(onlyDogs)").unwrap();
        let err = resolver.check_modifiers("Person", &expr).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidModifier);
    }

    #[test]
    fn test_id_key() {
        let registry = registry();
        let person = registry.model("Person").unwrap();
        assert_eq!(id_key(person, &json!(7)).unwrap(), vec![FilterValue::Int(7)]);
        assert!(id_key(person, &json!(null)).is_err());
        assert!(id_key(person, &json!([1, 2])).is_err());
    }

    #[test]
    fn test_options_from_config() {
        let config = KnitConfig::from_str("[eager]\nstrategy = \"join\"\nbatch_size = 10").unwrap();
        let options = EagerOptions::from(&config);
        assert_eq!(options.strategy, EagerStrategy::Join);
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.db_type, DatabaseType::PostgreSQL);
    }
}
