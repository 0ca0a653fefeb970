//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

use knit_orm::query::{BoxFuture, FilterValue, QueryError, QueryResult, Queryable, Record};
use knit_orm::schema::{ModelDescriptor, ModelRegistry, RelationDescriptor, ThroughTable};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// People with pets, parents, children and movies.
pub fn registry() -> ModelRegistry {
    ModelRegistry::builder()
        .model(
            ModelDescriptor::new("Person", "persons")
                .relation(RelationDescriptor::belongs_to_one("parent", "Person").owner(["parent_id"]))
                .relation(RelationDescriptor::has_many("children", "Person").related(["parent_id"]))
                .relation(RelationDescriptor::has_many("pets", "Animal").related(["owner_id"]))
                .relation(RelationDescriptor::many_to_many(
                    "movies",
                    "Movie",
                    ThroughTable::new("persons_movies", ["person_id"], ["movie_id"]).extra(["role"]),
                )),
        )
        .model(
            ModelDescriptor::new("Animal", "animals")
                .relation(RelationDescriptor::belongs_to_one("owner", "Person").owner(["owner_id"])),
        )
        .model(ModelDescriptor::new("Movie", "movies"))
        .build()
        .expect("fixture registry is valid")
}

/// Convert a JSON object into a row.
pub fn row(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, found {other}"),
    }
}

/// A scripted database.
///
/// Statements are recorded. `INSERT ... RETURNING *` yields a row with a
/// fresh `id`; any other statement yields the rows of the first registered
/// response whose pattern it contains.
#[derive(Default)]
pub struct MockDb {
    statements: Mutex<Vec<(String, Vec<FilterValue>)>>,
    responses: Vec<(String, Vec<Record>)>,
    columns: HashMap<String, Vec<String>>,
    fail_on: Option<String>,
    next_id: Mutex<i64>,
}

impl MockDb {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(100),
            ..Self::default()
        }
    }

    /// Answer statements containing `pattern` with `rows`.
    pub fn respond(mut self, pattern: &str, rows: impl IntoIterator<Item = Value>) -> Self {
        self.responses.push((pattern.to_string(), rows.into_iter().map(row).collect()));
        self
    }

    /// Report `columns` for `table`.
    pub fn columns(mut self, table: &str, columns: &[&str]) -> Self {
        self.columns
            .insert(table.to_string(), columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Fail statements containing `pattern`.
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.fail_on = Some(pattern.to_string());
        self
    }

    /// Recorded statements in execution order.
    pub fn sql(&self) -> Vec<String> {
        self.statements.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// Recorded statements that are not `SELECT`s.
    pub fn writes(&self) -> Vec<String> {
        self.sql().into_iter().filter(|sql| !sql.starts_with("SELECT")).collect()
    }

    /// Parameters of the first statement starting with `prefix`.
    pub fn params_of(&self, prefix: &str) -> Vec<FilterValue> {
        self.statements
            .lock()
            .iter()
            .find(|(sql, _)| sql.starts_with(prefix))
            .map(|(_, params)| params.clone())
            .unwrap_or_default()
    }
}

impl Queryable for MockDb {
    fn run_query(&self, sql: &str, params: Vec<FilterValue>) -> BoxFuture<'_, QueryResult<Vec<Record>>> {
        let sql = sql.to_string();
        Box::pin(async move {
            if self.fail_on.as_deref().is_some_and(|pattern| sql.contains(pattern)) {
                return Err(QueryError::database("connection reset"));
            }
            self.statements.lock().push((sql.clone(), params));

            if sql.starts_with("INSERT") && sql.ends_with("RETURNING *") {
                let mut next_id = self.next_id.lock();
                *next_id += 1;
                return Ok(vec![row(json!({ "id": *next_id }))]);
            }
            Ok(self
                .responses
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default())
        })
    }

    fn fetch_columns(&self, table: &str) -> BoxFuture<'_, QueryResult<Vec<String>>> {
        let columns = self.columns.get(table).cloned().unwrap_or_default();
        Box::pin(async move { Ok(columns) })
    }
}
