//! One batched query per relation and level.

use std::borrow::Cow;
use std::collections::HashMap;

use knit_schema::RelationExpression;
use knit_schema::model::RelationDescriptor;
use smol_str::SmolStr;
use tracing::trace;

use super::{
    EagerResolver, RANK_COLUMN, distinct_keys, empty_relation, relation_value, required_columns,
    through_alias, write_relation_select,
};
use crate::error::QueryResult;
use crate::filter::FilterValue;
use crate::modifier::RelationQuery;
use crate::sql::SqlBuilder;
use crate::traits::{BoxFuture, Queryable};
use crate::value::{IdentityKey, Record};

type Groups = HashMap<IdentityKey, Vec<Record>>;

pub(super) async fn resolve(
    resolver: &EagerResolver,
    db: &dyn Queryable,
    model: &str,
    mut rows: Vec<Record>,
    expr: &RelationExpression,
) -> QueryResult<Vec<Record>> {
    let children = expr.children().map(Cow::Borrowed).collect();
    load_children(resolver, db, model, &mut rows, children, 1).await?;
    Ok(rows)
}

fn load_children<'a>(
    resolver: &'a EagerResolver,
    db: &'a dyn Queryable,
    model: &'a str,
    rows: &'a mut Vec<Record>,
    children: Vec<Cow<'a, RelationExpression>>,
    depth: u32,
) -> BoxFuture<'a, QueryResult<()>> {
    Box::pin(async move {
        if rows.is_empty() || children.is_empty() {
            return Ok(());
        }

        let mut relations = Vec::with_capacity(children.len());
        for child in &children {
            relations.push(resolver.relation(model, child)?);
        }

        let loads = children.iter().zip(&relations).map(|(child, relation)| {
            let keys = distinct_keys(rows, &relation.owner_columns);
            load_relation(resolver, db, relation, child, keys, depth)
        });
        let loaded = resolver.executor.join_ordered(loads).await?;

        for ((child, relation), groups) in children.iter().zip(&relations).zip(loaded) {
            attach(rows, child.alias(), relation, &groups);
        }
        Ok(())
    })
}

async fn load_relation(
    resolver: &EagerResolver,
    db: &dyn Queryable,
    relation: &RelationDescriptor,
    node: &RelationExpression,
    keys: Vec<Vec<FilterValue>>,
    depth: u32,
) -> QueryResult<Groups> {
    if keys.is_empty() {
        return Ok(Groups::new());
    }

    let registry = resolver.registry();
    let related = registry.model(&relation.related_model)?;
    let grandchildren = resolver.child_nodes(node, depth);

    let mut query = resolver.relation_query(relation, node)?;
    for column in required_columns(registry, related, relation, &grandchildren)? {
        query.select.ensure(&column);
    }

    let group_columns: Vec<SmolStr> = match &relation.through {
        Some(through) => through.owner_columns.iter().map(|c| through_alias(c).into()).collect(),
        None => relation.related_columns.clone(),
    };

    let statements: Vec<_> = keys
        .chunks(resolver.options.batch_size.max(1))
        .map(|chunk| select_statement(resolver, relation, &related.table, &query, chunk.to_vec()))
        .collect::<QueryResult<_>>()?;

    let batches = resolver
        .executor
        .join_ordered(
            statements
                .into_iter()
                .map(|(sql, params)| resolver.run(db, sql, params)),
        )
        .await
        .map_err(|e| e.with_model(relation.related_model.as_str()))?;
    let mut rows: Vec<Record> = batches.into_iter().flatten().collect();

    trace!(relation = %relation.name, rows = rows.len(), depth, "relation rows fetched");

    load_children(resolver, db, &relation.related_model, &mut rows, grandchildren, depth + 1).await?;

    let mut groups = Groups::new();
    for mut row in rows {
        let key = IdentityKey::from_record(&row, &group_columns);
        restore_columns(&mut row, relation);
        if let Some(key) = key {
            groups.entry(key).or_default().push(row);
        }
    }
    Ok(groups)
}

fn select_statement(
    resolver: &EagerResolver,
    relation: &RelationDescriptor,
    table: &str,
    query: &RelationQuery,
    keys: Vec<Vec<FilterValue>>,
) -> QueryResult<(String, Vec<FilterValue>)> {
    let mut builder = SqlBuilder::new(resolver.options.db_type);
    let mut columns = String::new();
    query.select.write_sql(&mut columns, Some(table));
    write_relation_select(&mut builder, relation, table, &columns, query, Some(keys))?;
    Ok(builder.build())
}

/// Strip the generated columns of a fetched row; join-table extras take their
/// own names back.
fn restore_columns(row: &mut Record, relation: &RelationDescriptor) {
    row.remove(RANK_COLUMN);
    if let Some(through) = &relation.through {
        for column in &through.owner_columns {
            row.remove(through_alias(column).as_str());
        }
        for column in &through.extra {
            if let Some(value) = row.remove(through_alias(column).as_str()) {
                row.insert(column.to_string(), value);
            }
        }
    }
}

fn attach(rows: &mut [Record], alias: &str, relation: &RelationDescriptor, groups: &Groups) {
    for row in rows.iter_mut() {
        let value = match IdentityKey::from_record(row, &relation.owner_columns)
            .and_then(|key| groups.get(&key))
        {
            Some(related) => relation_value(relation.kind, related.clone()),
            None => empty_relation(relation.kind),
        };
        row.insert(alias.to_string(), value);
    }
}
