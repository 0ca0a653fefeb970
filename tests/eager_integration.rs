//! Integration tests for eager loading.

mod common;

use std::sync::Arc;

use common::{MockDb, row};
use knit_orm::prelude::*;
use knit_orm::query::{EagerResolver, ErrorCode};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn roots() -> Vec<Record> {
    vec![row(json!({"id": 1})), row(json!({"id": 2}))]
}

fn naive_db() -> MockDb {
    MockDb::new()
        .respond(
            r#"FROM "animals" WHERE"#,
            [
                json!({"id": 10, "name": "Rex", "owner_id": 1}),
                json!({"id": 11, "name": "Tom", "owner_id": 1}),
            ],
        )
        .respond(
            r#"FROM "persons" WHERE "persons"."parent_id""#,
            [json!({"id": 3, "name": "Kid", "parent_id": 2})],
        )
}

fn join_db() -> MockDb {
    MockDb::new()
        .columns("animals", &["id", "name", "owner_id"])
        .columns("persons", &["id", "name", "parent_id"])
        .respond(
            "LEFT JOIN",
            [
                json!({
                    "persons:id": 1,
                    "persons:pets:id": 10, "persons:pets:name": "Rex", "persons:pets:owner_id": 1,
                    "persons:children:id": null, "persons:children:name": null, "persons:children:parent_id": null
                }),
                json!({
                    "persons:id": 1,
                    "persons:pets:id": 11, "persons:pets:name": "Tom", "persons:pets:owner_id": 1,
                    "persons:children:id": null, "persons:children:name": null, "persons:children:parent_id": null
                }),
                json!({
                    "persons:id": 2,
                    "persons:pets:id": null, "persons:pets:name": null, "persons:pets:owner_id": null,
                    "persons:children:id": 3, "persons:children:name": "Kid", "persons:children:parent_id": 2
                }),
            ],
        )
}

fn as_json(rows: Vec<Record>) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}

#[tokio::test]
async fn test_join_and_naive_build_equal_trees() {
    let engine = GraphEngine::new(Arc::new(common::registry()));

    let naive = engine
        .eager(&naive_db(), "Person", roots(), "[pets, children]", EagerStrategy::Naive)
        .await
        .unwrap();
    let joined = engine
        .eager(&join_db(), "Person", roots(), "[pets, children]", EagerStrategy::Join)
        .await
        .unwrap();

    let expected = json!([
        {
            "id": 1,
            "pets": [
                {"id": 10, "name": "Rex", "owner_id": 1},
                {"id": 11, "name": "Tom", "owner_id": 1}
            ],
            "children": []
        },
        {"id": 2, "pets": [], "children": [{"id": 3, "name": "Kid", "parent_id": 2}]}
    ]);
    assert_eq!(as_json(naive), expected);
    assert_eq!(as_json(joined), expected);
}

#[tokio::test]
async fn test_naive_issues_one_query_per_relation() {
    let db = naive_db();
    let resolver = EagerResolver::new(Arc::new(common::registry()));
    let expr = parse_expression("[pets, children]").unwrap();
    resolver.resolve(&db, "Person", roots(), &expr).await.unwrap();

    let mut sql = db.sql();
    sql.sort();
    assert_eq!(
        sql,
        vec![
            r#"SELECT "animals".* FROM "animals" WHERE "animals"."owner_id" IN ($1, $2)"#,
            r#"SELECT "persons".* FROM "persons" WHERE "persons"."parent_id" IN ($1, $2)"#,
        ]
    );
}

#[tokio::test]
async fn test_belongs_to_attaches_object_or_null() {
    let db = MockDb::new().respond(r#"FROM "persons" WHERE"#, [json!({"id": 1, "name": "Jen"})]);
    let engine = GraphEngine::new(Arc::new(common::registry()));
    let pets = vec![
        row(json!({"id": 10, "owner_id": 1})),
        row(json!({"id": 11, "owner_id": null})),
    ];

    let loaded = engine
        .eager(&db, "Animal", pets, "owner", EagerStrategy::Naive)
        .await
        .unwrap();
    assert_eq!(loaded[0]["owner"], json!({"id": 1, "name": "Jen"}));
    assert_eq!(loaded[1]["owner"], Value::Null);
}

#[tokio::test]
async fn test_modifiers_shape_relation_query() {
    let db = naive_db();
    let modifiers = ModifierRegistry::new()
        .with("onlyDogs", |q| q.and_where(Filter::equals("species", "dog")))
        .with("byName", |q| q.order_by.push(OrderByField::asc("name")));
    let engine = GraphEngine::new(Arc::new(common::registry())).modifiers(modifiers);

    let loaded = engine
        .eager(&db, "Person", roots(), "dogs:pets(onlyDogs, byName)", EagerStrategy::Naive)
        .await
        .unwrap();

    assert_eq!(
        db.sql(),
        vec![
            r#"SELECT "animals".* FROM "animals" WHERE "animals"."owner_id" IN ($1, $2) AND ("animals"."species" = $3) ORDER BY "animals"."name" ASC"#
        ]
    );
    assert_eq!(loaded[0]["dogs"].as_array().map(Vec::len), Some(2));
    assert!(loaded[0].get("pets").is_none());
}

#[tokio::test]
async fn test_unknown_modifier_fails_before_querying() {
    let db = naive_db();
    let engine = GraphEngine::new(Arc::new(common::registry()));
    let err = engine
        .eager(&db, "Person", roots(), "pets(onlyDogs)", EagerStrategy::Naive)
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::InvalidModifier);
    assert!(db.sql().is_empty());
}

#[tokio::test]
async fn test_unknown_relation_is_reported() {
    let engine = GraphEngine::new(Arc::new(common::registry()));
    let err = engine
        .eager(&MockDb::new(), "Person", roots(), "toys", EagerStrategy::Naive)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RelationNotFound);
}

#[tokio::test]
async fn test_fetch_graph_loads_roots_by_id() {
    let db = naive_db().respond(r#"SELECT * FROM "persons" WHERE "id" IN"#, [json!({"id": 1, "name": "Jen"})]);
    let engine = GraphEngine::new(Arc::new(common::registry()));

    let loaded = engine.fetch_graph(&db, "Person", &[json!(1)], "pets").await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0]["name"], json!("Jen"));
    assert_eq!(loaded[0]["pets"][1]["name"], json!("Tom"));
}

#[tokio::test]
async fn test_query_failure_aborts_resolve() {
    let db = naive_db().fail_on("animals");
    let engine = GraphEngine::new(Arc::new(common::registry()));
    let err = engine
        .eager(&db, "Person", roots(), "[pets, children]", EagerStrategy::Naive)
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::DatabaseError);
    assert_eq!(err.context.model.as_deref(), Some("Animal"));
    assert!(err.context.sql.as_deref().is_some_and(|sql| sql.contains("animals")));
}

async fn both_strategies(
    engine: &GraphEngine,
    naive_db: &MockDb,
    join_db: &MockDb,
    roots: Vec<Record>,
    expr: &str,
) -> (Value, Value) {
    let naive = engine
        .eager(naive_db, "Person", roots.clone(), expr, EagerStrategy::Naive)
        .await
        .unwrap();
    let joined = engine
        .eager(join_db, "Person", roots, expr, EagerStrategy::Join)
        .await
        .unwrap();
    (as_json(naive), as_json(joined))
}

#[tokio::test]
async fn test_recursive_expressions_resolve_equally() {
    let naive_db = || {
        MockDb::new()
            .respond(
                r#""persons"."parent_id" IN ($1, $2)"#,
                [json!({"id": 4, "name": "D", "parent_id": 2})],
            )
            .respond(
                r#""persons"."parent_id" IN ($1)"#,
                [
                    json!({"id": 2, "name": "B", "parent_id": 1}),
                    json!({"id": 3, "name": "C", "parent_id": 1}),
                ],
            )
    };
    let join_db = || {
        MockDb::new().columns("persons", &["id", "name", "parent_id"]).respond(
            "LEFT JOIN",
            [
                json!({
                    "persons:id": 1,
                    "persons:children:id": 2, "persons:children:name": "B", "persons:children:parent_id": 1,
                    "persons:children:children:id": 4, "persons:children:children:name": "D",
                    "persons:children:children:parent_id": 2
                }),
                json!({
                    "persons:id": 1,
                    "persons:children:id": 3, "persons:children:name": "C", "persons:children:parent_id": 1,
                    "persons:children:children:id": null, "persons:children:children:name": null,
                    "persons:children:children:parent_id": null
                }),
            ],
        )
    };
    let expected = json!([{
        "id": 1,
        "children": [
            {"id": 2, "name": "B", "parent_id": 1, "children": [{"id": 4, "name": "D", "parent_id": 2}]},
            {"id": 3, "name": "C", "parent_id": 1, "children": []}
        ]
    }]);

    let engine = GraphEngine::new(Arc::new(common::registry()));
    let (naive, joined) =
        both_strategies(&engine, &naive_db(), &join_db(), vec![row(json!({"id": 1}))], "children.^2").await;
    assert_eq!(naive, expected);
    assert_eq!(joined, expected);

    let config = KnitConfig::from_str("[eager]\nmax_recursion_depth = 2").unwrap();
    let engine = GraphEngine::new(Arc::new(common::registry())).config(&config);
    let db = naive_db();
    let (naive, joined) =
        both_strategies(&engine, &db, &join_db(), vec![row(json!({"id": 1}))], "children.^").await;
    assert_eq!(naive, expected);
    assert_eq!(joined, expected);
    assert_eq!(db.sql().len(), 2);
}

#[tokio::test]
async fn test_many_to_many_carries_join_table_extras() {
    let naive_db = MockDb::new().respond(
        r#"INNER JOIN "persons_movies""#,
        [
            json!({"id": 5, "title": "M", "role": "movie column", "$through:person_id": 1, "$through:role": "lead"}),
            json!({"id": 5, "title": "M", "role": "movie column", "$through:person_id": 2, "$through:role": "extra"}),
            json!({"id": 6, "title": "N", "role": null, "$through:person_id": 1, "$through:role": null}),
        ],
    );
    let join_db = MockDb::new().columns("movies", &["id", "title", "role"]).respond(
        "LEFT JOIN",
        [
            json!({
                "persons:id": 1, "persons:movies:id": 5, "persons:movies:title": "M",
                "persons:movies:role": "movie column", "persons:movies:$through:role": "lead"
            }),
            json!({
                "persons:id": 1, "persons:movies:id": 6, "persons:movies:title": "N",
                "persons:movies:role": null, "persons:movies:$through:role": null
            }),
            json!({
                "persons:id": 2, "persons:movies:id": 5, "persons:movies:title": "M",
                "persons:movies:role": "movie column", "persons:movies:$through:role": "extra"
            }),
        ],
    );

    let engine = GraphEngine::new(Arc::new(common::registry()));
    let (naive, joined) = both_strategies(&engine, &naive_db, &join_db, roots(), "movies").await;

    let expected = json!([
        {
            "id": 1,
            "movies": [
                {"id": 5, "title": "M", "role": "lead"},
                {"id": 6, "title": "N", "role": null}
            ]
        },
        {"id": 2, "movies": [{"id": 5, "title": "M", "role": "extra"}]}
    ]);
    assert_eq!(naive, expected);
    assert_eq!(joined, expected);

    assert_eq!(
        naive_db.sql(),
        vec![concat!(
            r#"SELECT "movies".*, "persons_movies"."person_id" AS "$through:person_id", "persons_movies"."role" AS "$through:role" "#,
            r#"FROM "movies" INNER JOIN "persons_movies" ON "persons_movies"."movie_id" = "movies"."id" "#,
            r#"WHERE "persons_movies"."person_id" IN ($1, $2)"#,
        )]
    );
}

#[tokio::test]
async fn test_limit_modifier_applies_per_parent() {
    let modifiers = ModifierRegistry::new().with("firstTwo", |q| {
        q.order_by.push(OrderByField::asc("name"));
        q.limit = Some(2);
    });
    let engine = GraphEngine::new(Arc::new(common::registry())).modifiers(modifiers);

    let naive_db = MockDb::new().respond(
        r#"FROM "animals" WHERE"#,
        [
            json!({"id": 10, "name": "Ann", "owner_id": 1, "$rank": 1}),
            json!({"id": 12, "name": "Cy", "owner_id": 2, "$rank": 1}),
            json!({"id": 11, "name": "Bo", "owner_id": 1, "$rank": 2}),
        ],
    );
    let join_db = MockDb::new().columns("animals", &["id", "name", "owner_id"]).respond(
        "LEFT JOIN",
        [
            json!({"persons:id": 1, "persons:pets:id": 10, "persons:pets:name": "Ann", "persons:pets:owner_id": 1}),
            json!({"persons:id": 1, "persons:pets:id": 11, "persons:pets:name": "Bo", "persons:pets:owner_id": 1}),
            json!({"persons:id": 2, "persons:pets:id": 12, "persons:pets:name": "Cy", "persons:pets:owner_id": 2}),
        ],
    );

    let (naive, joined) = both_strategies(&engine, &naive_db, &join_db, roots(), "pets(firstTwo)").await;
    let expected = json!([
        {
            "id": 1,
            "pets": [
                {"id": 10, "name": "Ann", "owner_id": 1},
                {"id": 11, "name": "Bo", "owner_id": 1}
            ]
        },
        {"id": 2, "pets": [{"id": 12, "name": "Cy", "owner_id": 2}]}
    ]);
    assert_eq!(naive, expected);
    assert_eq!(joined, expected);

    let ranked = r#"ROW_NUMBER() OVER (PARTITION BY "animals"."owner_id" ORDER BY "animals"."name" ASC) AS "$rank""#;
    for sql in naive_db.sql().iter().chain(&join_db.sql()) {
        assert!(sql.contains(ranked), "{sql}");
        assert!(sql.contains(r#"WHERE "$ranked"."$rank" <= 2"#), "{sql}");
    }
}
