//! # Knit
//!
//! A relation-graph engine for SQL databases.
//!
//! Knit provides:
//! - A relation-expression language (`[pets(onlyDogs), children.^]`) naming
//!   which relations to load or write
//! - Eager loading with batched per-relation queries or a single join
//! - Graph inserts and upserts that diff a nested JSON document against the
//!   stored rows and write only what changed, in dependency order
//! - `#id` / `#ref` labels for linking nodes within one graph
//!
//! The database driver is yours: implement [`Queryable`](query::Queryable)
//! for a connection or pool.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use knit_orm::prelude::*;
//! use serde_json::json;
//!
//! # async fn run(db: &dyn Queryable) -> QueryResult<()> {
//! let registry = ModelRegistry::builder()
//!     .model(
//!         ModelDescriptor::new("Person", "persons")
//!             .relation(RelationDescriptor::has_many("pets", "Animal").related(["owner_id"])),
//!     )
//!     .model(ModelDescriptor::new("Animal", "animals"))
//!     .build()?;
//!
//! let engine = GraphEngine::new(Arc::new(registry));
//!
//! engine
//!     .upsert_graph(db, "Person", &json!({
//!         "id": 1,
//!         "pets": [{ "id": 10, "name": "Rex" }, { "name": "Fluffy" }],
//!     }), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Models, relations, relation expressions and configuration.
pub mod schema {
    pub use knit_schema::*;
}

/// Eager loading, graph planning and execution.
pub mod query {
    pub use knit_query::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use knit_query::prelude::*;
    pub use knit_schema::{RelationExpression, parse_expression};
}

// Re-export key types at the crate root
pub use knit_query::{GraphEngine, QueryError, QueryResult};
pub use knit_schema::{KnitConfig, ModelRegistry, SchemaError};
