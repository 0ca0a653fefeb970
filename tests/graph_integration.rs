//! Integration tests for graph inserts and upserts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockDb;
use knit_orm::prelude::*;
use knit_orm::query::graph::{Graph, planner};
use knit_orm::query::{ErrorCode, FilterValue};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn engine() -> GraphEngine {
    GraphEngine::new(Arc::new(common::registry()))
}

fn described(plan: &OperationPlan) -> Vec<String> {
    plan.iter().map(ToString::to_string).collect()
}

fn persisted_person() -> MockDb {
    MockDb::new()
        .respond(r#"SELECT * FROM "persons" WHERE "id" IN"#, [json!({"id": 1, "name": "Jen"})])
        .respond(
            r#"FROM "animals" WHERE"#,
            [
                json!({"id": 10, "name": "Old", "owner_id": 1}),
                json!({"id": 11, "name": "Gone", "owner_id": 1}),
            ],
        )
}

#[test]
fn test_plan_without_existing_graph_only_inserts_and_relates() {
    let registry = common::registry();
    let graphs = [
        json!({"name": "A", "parent": {"name": "P"}, "pets": [{"name": "Rex"}]}),
        json!({
            "name": "A",
            "movies": [{"#id": "m", "title": "M"}],
            "children": [{"name": "B", "movies": [{"#ref": "m"}]}]
        }),
        json!([{"id": 5, "name": "keyed"}, {"name": "A", "movies": [{"id": 7}]}]),
        json!([{"#id": "p", "name": "A"}, {"name": "#ref{p.name}", "children": [{"name": "C"}]}]),
    ];

    for value in &graphs {
        let incoming = Graph::from_json(&registry, "Person", value).unwrap();
        let empty = Graph::empty("Person");
        for (existing, options) in [
            (None, UpsertOptions::insert_graph()),
            (Some(&empty), UpsertOptions::default()),
        ] {
            let plan = planner::plan(&registry, existing, &incoming, &options).unwrap();
            assert!(!plan.is_empty(), "{value}");
            for op in &plan {
                assert!(
                    matches!(op, Operation::Insert { .. } | Operation::Relate { .. }),
                    "{value}: {op}"
                );
            }
        }
    }
}

#[tokio::test]
async fn test_replanning_persisted_graph_is_empty() {
    let db = MockDb::new();
    let registry = common::registry();
    let roots = engine()
        .insert_graph(
            &db,
            "Person",
            &json!({
                "name": "Jen",
                "pets": [{"name": "Rex"}, {"name": "Tom"}],
                "movies": [{"title": "M"}],
                "children": [{"name": "Kid"}]
            }),
        )
        .await
        .unwrap();

    let existing = Graph::from_records(&registry, "Person", &roots).unwrap();
    let incoming = Graph::from_records(&registry, "Person", &roots).unwrap();
    let plan = planner::plan(&registry, Some(&existing), &incoming, &UpsertOptions::default()).unwrap();
    assert!(plan.is_empty(), "{:?}", described(&plan));
}

#[tokio::test]
async fn test_upsert_patches_and_deletes() {
    let engine = engine();
    let value = json!({"id": 1, "pets": [{"id": 10, "name": "Rex"}]});

    let plan = engine
        .plan_upsert_graph(&persisted_person(), "Person", &value, None)
        .await
        .unwrap();
    assert_eq!(
        described(&plan),
        vec![r#"patch Animal (10) {name: "Rex"}"#, "delete Animal (11)"]
    );

    let db = persisted_person();
    let roots = engine.upsert_graph(&db, "Person", &value, None).await.unwrap();
    assert_eq!(
        db.writes(),
        vec![
            r#"UPDATE "animals" SET "name" = $1 WHERE "id" = $2"#,
            r#"DELETE FROM "animals" WHERE "id" = $1"#,
        ]
    );
    assert_eq!(db.params_of("DELETE"), vec![FilterValue::Int(11)]);

    let pets = roots[0]["pets"].as_array().unwrap();
    assert_eq!(pets.len(), 1);
    assert_eq!(pets[0]["name"], json!("Rex"));
}

#[tokio::test]
async fn test_plan_upsert_does_not_write() {
    let db = persisted_person();
    engine()
        .plan_upsert_graph(&db, "Person", &json!({"id": 1, "pets": []}), None)
        .await
        .unwrap();
    assert!(db.writes().is_empty());
    assert!(!db.sql().is_empty());
}

#[tokio::test]
async fn test_upsert_options_from_caller() {
    let engine = engine();
    let value = json!({"id": 1, "pets": [{"id": 10, "name": "Old"}]});

    let kept = UpsertOptions::new().no_delete(["pets"]);
    let plan = engine
        .plan_upsert_graph(&persisted_person(), "Person", &value, Some(&kept))
        .await
        .unwrap();
    assert!(plan.is_empty(), "{:?}", described(&plan));

    let unrelated = UpsertOptions::new().unrelate(true);
    let plan = engine
        .plan_upsert_graph(&persisted_person(), "Person", &value, Some(&unrelated))
        .await
        .unwrap();
    assert_eq!(described(&plan), vec!["unrelate Animal (11) from Person.pets"]);
}

#[tokio::test]
async fn test_upsert_relates_existing_movie() {
    let db = MockDb::new().respond(r#"SELECT * FROM "persons" WHERE "id" IN"#, [json!({"id": 1})]);
    let value = json!({"id": 1, "movies": [{"id": 5}]});

    engine().upsert_graph(&db, "Person", &value, None).await.unwrap();
    assert_eq!(
        db.writes(),
        vec![r#"INSERT INTO "persons_movies" ("person_id", "movie_id") VALUES ($1, $2)"#]
    );
    assert_eq!(
        db.params_of("INSERT"),
        vec![FilterValue::Int(1), FilterValue::Int(5)]
    );
}

#[tokio::test]
async fn test_reference_template_ignores_array_order() {
    for value in [
        json!([{"#id": "p", "name": "A"}, {"name": "#ref{p.name}"}]),
        json!([{"name": "#ref{p.name}"}, {"#id": "p", "name": "A"}]),
    ] {
        let db = MockDb::new();
        let roots = engine().insert_graph(&db, "Person", &value).await.unwrap();

        assert_eq!(db.writes().len(), 2);
        assert_eq!(db.params_of("INSERT"), vec![FilterValue::from("A")]);
        let names: Vec<&Value> = roots.iter().map(|r| &r["name"]).collect();
        assert_eq!(names, vec![&json!("A"), &json!("A")], "{value}");
    }
}

#[tokio::test]
async fn test_reference_to_generated_key() {
    let db = MockDb::new();
    let value = json!({
        "name": "Jen",
        "movies": [{"#id": "m", "title": "M"}],
        "children": [{"name": "Kid", "movies": [{"#ref": "m"}]}]
    });
    let roots = engine().insert_graph(&db, "Person", &value).await.unwrap();

    let movie_id = roots[0]["movies"][0]["id"].clone();
    assert!(movie_id.is_number());
    assert_eq!(roots[0]["children"][0]["movies"][0]["id"], movie_id);
    assert_eq!(
        db.writes()
            .iter()
            .filter(|sql| sql.starts_with(r#"INSERT INTO "movies""#))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_graph_errors_are_raised_before_any_query() {
    let cases = [
        (
            json!([{"#id": "a", "name": "#ref{b.name}"}, {"#id": "b", "name": "#ref{a.name}"}]),
            ErrorCode::CyclicGraph,
        ),
        (
            json!([{"#id": "a", "name": "x"}, {"#id": "a", "name": "y"}]),
            ErrorCode::DuplicateId,
        ),
        (json!({"name": "#ref{nobody.name}"}), ErrorCode::UnresolvedReference),
        (
            json!({"name": "A", "parent": [{"name": "x"}, {"name": "y"}]}),
            ErrorCode::InvalidGraph,
        ),
        (json!([{"name": "A"}, {"#ref": "a"}]), ErrorCode::UnresolvedReference),
    ];

    for (value, code) in cases {
        let db = MockDb::new();
        let err = engine().insert_graph(&db, "Person", &value).await.unwrap_err();
        assert_eq!(err.code, code, "{value}: {err}");
        assert!(db.sql().is_empty(), "{value}");
    }
}

#[tokio::test]
async fn test_failed_statement_stops_execution_with_context() {
    let db = MockDb::new().fail_on("animals");
    let err = engine()
        .insert_graph(&db, "Person", &json!({"name": "A", "pets": [{"name": "Rex"}, {"name": "Tom"}]}))
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::DatabaseError);
    assert_eq!(err.context.table.as_deref(), Some("animals"));
    assert_eq!(err.context.model.as_deref(), Some("Animal"));
    assert_eq!(db.writes(), vec![r#"INSERT INTO "persons" ("name") VALUES ($1) RETURNING *"#]);
}

#[derive(Default)]
struct Recording(Arc<Mutex<Vec<String>>>);

impl OperationHook for Recording {
    fn after_operation(&self, index: usize, operation: &Operation, _elapsed: Duration) {
        self.0.lock().push(format!("{index}: {}", operation.kind()));
    }
}

#[tokio::test]
async fn test_hooks_observe_operations() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = engine()
        .hook(TracingHook::new())
        .hook(Recording(seen.clone()));

    engine
        .insert_graph(&MockDb::new(), "Person", &json!({"name": "A", "movies": [{"title": "M"}]}))
        .await
        .unwrap();
    assert_eq!(*seen.lock(), vec!["0: insert", "1: insert", "2: relate"]);
}

#[test]
fn test_config_drives_engine_defaults() {
    let config = KnitConfig::from_str(
        r#"
        [eager]
        strategy = "join"

        [upsert]
        no_delete = true
        relate = true
        "#,
    )
    .unwrap();
    let engine = engine().config(&config);

    assert!(engine.default_upsert_options().no_delete.enabled_for("pets"));
    assert!(engine.default_upsert_options().relate.enabled_for("movies"));
    assert_eq!(engine.resolver().options().strategy, EagerStrategy::Join);
}
