//! One statement of nested left joins, folded back into trees.
//!
//! Every joined relation is a subquery aliased by its alias path
//! (`persons:pets:owner`), and every selected column is aliased
//! `<alias path>:<column>`. Identifiers cannot contain `:`, so the paths never
//! collide with real columns.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use knit_schema::RelationExpression;
use knit_schema::model::RelationDescriptor;
use serde_json::Value;
use smol_str::SmolStr;
use tracing::{debug, trace};

use super::{
    EagerResolver, empty_relation, relation_value, required_columns, through_alias, write_relation_select,
};
use crate::error::QueryResult;
use crate::filter::{Filter, FilterValue};
use crate::modifier::RelationQuery;
use crate::sql::{SqlBuilder, escape_identifier, qualified};
use crate::traits::Queryable;
use crate::types::Select;
use crate::value::{IdentityKey, Record, key_values};

/// One aliased subquery of the statement.
#[derive(Debug)]
struct JoinNode<'r> {
    path: String,
    alias: SmolStr,
    relation: Option<&'r RelationDescriptor>,
    table: SmolStr,
    id_columns: Vec<SmolStr>,
    columns: Vec<String>,
    extra: Vec<SmolStr>,
    query: RelationQuery,
    children: Vec<JoinNode<'r>>,
}

impl JoinNode<'_> {
    fn column_alias(&self, column: &str) -> String {
        format!("{}:{}", self.path, column)
    }

    fn identity(&self, row: &Record) -> Option<IdentityKey> {
        let values = self
            .id_columns
            .iter()
            .map(|c| row.get(&self.column_alias(c)))
            .collect::<Option<Vec<_>>>()?;
        IdentityKey::from_values(values)
    }

    /// Join-table extras are selected under their reserved alias and named
    /// back here, so they win over a related column of the same name.
    fn extract(&self, row: &Record) -> Record {
        let value = |alias: String| row.get(&alias).cloned().unwrap_or(Value::Null);
        let mut record: Record = self
            .columns
            .iter()
            .map(|column| (column.clone(), value(self.column_alias(column))))
            .collect();
        for column in &self.extra {
            record.insert(column.to_string(), value(self.column_alias(&through_alias(column))));
        }
        record
    }
}

pub(super) async fn resolve(
    resolver: &EagerResolver,
    db: &dyn Queryable,
    model: &str,
    mut rows: Vec<Record>,
    expr: &RelationExpression,
) -> QueryResult<Vec<Record>> {
    let registry = resolver.registry();
    let root_model = registry.model(model)?;

    let mut tables = IndexSet::new();
    collect_tables(resolver, model, expr, 0, &mut tables)?;
    let fetched = resolver
        .executor
        .join_ordered(tables.iter().map(|table| {
            resolver
                .executor
                .limited(db.fetch_columns(table.as_str()))
        }))
        .await?;
    let columns: HashMap<SmolStr, Vec<String>> = tables.into_iter().zip(fetched).collect();

    let root = JoinNode {
        path: root_model.table.to_string(),
        alias: SmolStr::default(),
        relation: None,
        table: root_model.table.clone(),
        id_columns: root_model.id_columns.clone(),
        columns: root_model.id_columns.iter().map(|c| c.to_string()).collect(),
        extra: Vec::new(),
        query: RelationQuery::default(),
        children: build_children(resolver, model, expr, &root_model.table, 0, &columns)?,
    };

    let mut seen = HashSet::new();
    let keys: Vec<Vec<FilterValue>> = rows
        .iter()
        .filter(|row| {
            IdentityKey::from_record(row, &root.id_columns).is_some_and(|k| seen.insert(k))
        })
        .filter_map(|row| key_values(row, &root.id_columns))
        .collect();

    let statements: Vec<_> = keys
        .chunks(resolver.options.batch_size.max(1))
        .map(|chunk| statement(resolver, &root, chunk.to_vec()))
        .collect::<QueryResult<_>>()?;
    debug!(model, statements = statements.len(), "join statement built");

    let batches = resolver
        .executor
        .join_ordered(statements.into_iter().map(|(sql, params)| resolver.run(db, sql, params)))
        .await?;

    let mut folded = FoldedSet::default();
    for row in batches.iter().flatten() {
        fold(&root, row, &mut folded);
    }
    trace!(model, roots = folded.rows.len(), "join rows folded");

    for row in &mut rows {
        let found = IdentityKey::from_record(row, &root.id_columns).and_then(|k| folded.rows.get(&k));
        for (i, child) in root.children.iter().enumerate() {
            let value = match found {
                Some(parent) => parent.relations[i].to_value(child),
                None => empty_relation(kind_of(child)),
            };
            row.insert(child.alias.to_string(), value);
        }
    }
    Ok(rows)
}

fn kind_of(node: &JoinNode<'_>) -> knit_schema::RelationKind {
    node.relation
        .map(|r| r.kind)
        .unwrap_or(knit_schema::RelationKind::HasMany)
}

fn collect_tables(
    resolver: &EagerResolver,
    model: &str,
    node: &RelationExpression,
    depth: u32,
    tables: &mut IndexSet<SmolStr>,
) -> QueryResult<()> {
    let children = if node.is_root() {
        node.children().map(Cow::Borrowed).collect()
    } else {
        resolver.child_nodes(node, depth)
    };
    for child in &children {
        let relation = resolver.relation(model, child)?;
        let related = resolver.registry().model(&relation.related_model)?;
        tables.insert(related.table.clone());
        collect_tables(resolver, &relation.related_model, child, depth + 1, tables)?;
    }
    Ok(())
}

fn build_children<'r>(
    resolver: &'r EagerResolver,
    model: &str,
    node: &RelationExpression,
    parent_path: &str,
    depth: u32,
    columns: &HashMap<SmolStr, Vec<String>>,
) -> QueryResult<Vec<JoinNode<'r>>> {
    let children = if node.is_root() {
        node.children().map(Cow::Borrowed).collect()
    } else {
        resolver.child_nodes(node, depth)
    };

    let registry = resolver.registry();
    let mut nodes = Vec::with_capacity(children.len());
    for child in &children {
        let relation = resolver.relation(model, child)?;
        let related = registry.model(&relation.related_model)?;
        let path = format!("{parent_path}:{}", child.alias());

        let mut query = resolver.relation_query(relation, child)?;
        let grandchildren = resolver.child_nodes(child, depth + 1);
        let required = required_columns(registry, related, relation, &grandchildren)?;
        for column in &required {
            query.select.ensure(column);
        }
        let selected = match &query.select {
            Select::All => columns.get(&related.table).cloned().unwrap_or_default(),
            Select::Columns(list) => list.clone(),
        };

        nodes.push(JoinNode {
            children: build_children(resolver, &relation.related_model, child, &path, depth + 1, columns)?,
            path,
            alias: SmolStr::new(child.alias()),
            relation: Some(relation),
            table: related.table.clone(),
            id_columns: related.id_columns.clone(),
            columns: selected,
            extra: relation.through.as_ref().map(|t| t.extra.clone()).unwrap_or_default(),
            query,
        });
    }
    Ok(nodes)
}

fn statement(
    resolver: &EagerResolver,
    root: &JoinNode<'_>,
    keys: Vec<Vec<FilterValue>>,
) -> QueryResult<(String, Vec<FilterValue>)> {
    let mut builder = SqlBuilder::new(resolver.options.db_type);

    let mut select = Vec::new();
    select_list(root, &mut select);
    builder.push("SELECT ").push(select.join(", "));

    builder
        .push(" FROM (SELECT * FROM ")
        .push_identifier(&root.table)
        .push(" WHERE ");
    Filter::keys_in(&root.id_columns, keys).write_sql(&mut builder, Some(&root.table));
    builder.push(") AS ").push_identifier(&root.path);

    for child in &root.children {
        write_join(&mut builder, root, child)?;
    }
    Ok(builder.build())
}

fn select_list(node: &JoinNode<'_>, out: &mut Vec<String>) {
    let extras = node.extra.iter().map(|c| through_alias(c));
    for column in node.columns.iter().cloned().chain(extras) {
        out.push(format!(
            "{} AS {}",
            qualified(&node.path, &column),
            escape_identifier(&node.column_alias(&column))
        ));
    }
    for child in &node.children {
        select_list(child, out);
    }
}

fn write_join(builder: &mut SqlBuilder, parent: &JoinNode<'_>, node: &JoinNode<'_>) -> QueryResult<()> {
    let Some(relation) = node.relation else {
        return Ok(());
    };
    let table = node.table.as_str();

    builder.push(" LEFT JOIN (");
    let mut columns = String::new();
    Select::columns(node.columns.iter().cloned()).write_sql(&mut columns, Some(table));
    write_relation_select(builder, relation, table, &columns, &node.query, None)?;

    builder.push(") AS ").push_identifier(&node.path).push(" ON ");
    let join_columns: Vec<String> = match &relation.through {
        Some(through) => through.owner_columns.iter().map(|c| through_alias(c)).collect(),
        None => relation.related_columns.iter().map(|c| c.to_string()).collect(),
    };
    for (i, (column, owner_column)) in join_columns.iter().zip(&relation.owner_columns).enumerate() {
        if i > 0 {
            builder.push(" AND ");
        }
        builder
            .push(qualified(&node.path, column))
            .push(" = ")
            .push(qualified(&parent.path, owner_column));
    }

    for child in &node.children {
        write_join(builder, node, child)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct FoldedSet {
    rows: IndexMap<IdentityKey, FoldedRow>,
}

#[derive(Debug)]
struct FoldedRow {
    record: Record,
    relations: Vec<FoldedSet>,
}

impl FoldedSet {
    fn to_value(&self, node: &JoinNode<'_>) -> Value {
        let rows = self.rows.values().map(|row| row.to_record(node)).collect();
        relation_value(kind_of(node), rows)
    }
}

impl FoldedRow {
    fn to_record(&self, node: &JoinNode<'_>) -> Record {
        let mut record = self.record.clone();
        for (child, set) in node.children.iter().zip(&self.relations) {
            record.insert(child.alias.to_string(), set.to_value(child));
        }
        record
    }
}

/// Fold one flat row into `set`; a path whose key columns are null is absent.
fn fold(node: &JoinNode<'_>, row: &Record, set: &mut FoldedSet) {
    let Some(key) = node.identity(row) else {
        return;
    };
    let entry = set.rows.entry(key).or_insert_with(|| FoldedRow {
        record: node.extract(row),
        relations: node.children.iter().map(|_| FoldedSet::default()).collect(),
    });
    for (child, child_set) in node.children.iter().zip(entry.relations.iter_mut()) {
        fold(child, row, child_set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::ModifierRegistry;
    use crate::types::OrderByField;
    use knit_schema::model::{ModelDescriptor, ModelRegistry, ThroughTable};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn resolver() -> EagerResolver {
        let registry = ModelRegistry::builder()
            .model(
                ModelDescriptor::new("Person", "persons")
                    .relation(RelationDescriptor::has_many("pets", "Animal").related(["owner_id"]))
                    .relation(RelationDescriptor::many_to_many(
                        "movies",
                        "Movie",
                        ThroughTable::new("persons_movies", ["person_id"], ["movie_id"]).extra(["role"]),
                    )),
            )
            .model(ModelDescriptor::new("Animal", "animals"))
            .model(ModelDescriptor::new("Movie", "movies"))
            .build()
            .unwrap();
        EagerResolver::new(Arc::new(registry)).modifiers(
            ModifierRegistry::new()
                .with("byName", |q: &mut RelationQuery| q.order_by.push(OrderByField::asc("name")))
                .with("firstTwo", |q: &mut RelationQuery| {
                    q.order_by.push(OrderByField::asc("name"));
                    q.limit = Some(2);
                }),
        )
    }

    fn columns() -> HashMap<SmolStr, Vec<String>> {
        HashMap::from([
            (SmolStr::new("animals"), vec!["id".to_string(), "name".into(), "owner_id".into()]),
            (SmolStr::new("movies"), vec!["id".to_string(), "title".into(), "role".into()]),
        ])
    }

    fn root<'r>(resolver: &'r EagerResolver, expr: &RelationExpression) -> JoinNode<'r> {
        JoinNode {
            path: "persons".into(),
            alias: SmolStr::default(),
            relation: None,
            table: "persons".into(),
            id_columns: vec!["id".into()],
            columns: vec!["id".into()],
            extra: Vec::new(),
            query: RelationQuery::default(),
            children: build_children(resolver, "Person", expr, "persons", 0, &columns()).unwrap(),
        }
    }

    #[test]
    fn test_statement_shape() {
        let resolver = resolver();
        let expr = knit_schema::parse_expression("[pets(byName), movies]").unwrap();
        let root = root(&resolver, &expr);
        let (sql, params) = statement(&resolver, &root, vec![vec![FilterValue::Int(1)]]).unwrap();

        assert_eq!(
            sql,
            concat!(
                r#"SELECT "persons"."id" AS "persons:id", "persons:pets"."id" AS "persons:pets:id", "#,
                r#""persons:pets"."name" AS "persons:pets:name", "persons:pets"."owner_id" AS "persons:pets:owner_id", "#,
                r#""persons:movies"."id" AS "persons:movies:id", "persons:movies"."title" AS "persons:movies:title", "#,
                r#""persons:movies"."role" AS "persons:movies:role", "persons:movies"."$through:role" AS "persons:movies:$through:role" "#,
                r#"FROM (SELECT * FROM "persons" WHERE "persons"."id" IN ($1)) AS "persons" "#,
                r#"LEFT JOIN (SELECT "animals"."id", "animals"."name", "animals"."owner_id" FROM "animals" ORDER BY "animals"."name" ASC) AS "persons:pets" ON "persons:pets"."owner_id" = "persons"."id" "#,
                r#"LEFT JOIN (SELECT "movies"."id", "movies"."title", "movies"."role", "persons_movies"."person_id" AS "$through:person_id", "#,
                r#""persons_movies"."role" AS "$through:role" FROM "movies" INNER JOIN "persons_movies" ON "persons_movies"."movie_id" = "movies"."id") "#,
                r#"AS "persons:movies" ON "persons:movies"."$through:person_id" = "persons"."id""#,
            )
        );
        assert_eq!(params, vec![FilterValue::Int(1)]);
    }

    #[test]
    fn test_fold_dedups_and_treats_null_paths_as_absent() {
        let resolver = resolver();
        let expr = knit_schema::parse_expression("[pets, movies]").unwrap();
        let root = root(&resolver, &expr);

        let flat: Vec<Record> = [
            json!({"persons:id": 1, "persons:pets:id": 10, "persons:pets:name": "Rex", "persons:pets:owner_id": 1, "persons:movies:id": 100, "persons:movies:title": "A", "persons:movies:role": "movie column", "persons:movies:$through:role": "lead"}),
            json!({"persons:id": 1, "persons:pets:id": 10, "persons:pets:name": "Rex", "persons:pets:owner_id": 1, "persons:movies:id": 101, "persons:movies:title": "B", "persons:movies:role": null, "persons:movies:$through:role": "extra"}),
            json!({"persons:id": 2, "persons:pets:id": null, "persons:pets:name": null, "persons:pets:owner_id": null, "persons:movies:id": null, "persons:movies:title": null, "persons:movies:role": null, "persons:movies:$through:role": null}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();

        let mut set = FoldedSet::default();
        for row in &flat {
            fold(&root, row, &mut set);
        }

        assert_eq!(set.rows.len(), 2);
        let first = set.rows.values().next().unwrap().to_record(&root);
        assert_eq!(
            Value::Object(first),
            json!({
                "id": 1,
                "pets": [{"id": 10, "name": "Rex", "owner_id": 1}],
                "movies": [{"id": 100, "title": "A", "role": "lead"}, {"id": 101, "title": "B", "role": "extra"}]
            })
        );
        let second = set.rows.values().nth(1).unwrap().to_record(&root);
        assert_eq!(Value::Object(second), json!({"id": 2, "pets": [], "movies": []}));
    }

    #[test]
    fn test_limit_ranks_rows_per_parent() {
        let resolver = resolver();
        let expr = knit_schema::parse_expression("pets(firstTwo)").unwrap();
        let root = root(&resolver, &expr);
        let (sql, _) = statement(&resolver, &root, vec![vec![FilterValue::Int(1)], vec![FilterValue::Int(2)]]).unwrap();

        assert!(
            sql.ends_with(concat!(
                r#"LEFT JOIN (SELECT * FROM (SELECT "animals"."id", "animals"."name", "animals"."owner_id", "#,
                r#"ROW_NUMBER() OVER (PARTITION BY "animals"."owner_id" ORDER BY "animals"."name" ASC) AS "$rank" FROM "animals") "#,
                r#"AS "$ranked" WHERE "$ranked"."$rank" <= 2 ORDER BY "$ranked"."$rank") "#,
                r#"AS "persons:pets" ON "persons:pets"."owner_id" = "persons"."id""#,
            )),
            "{sql}"
        );
    }
}
