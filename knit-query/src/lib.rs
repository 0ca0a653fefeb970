//! # knit-query
//!
//! Eager loading and graph writes for the Knit relation-graph engine.
//!
//! This crate provides:
//! - Eager loading of relation expressions onto loaded rows, either with one
//!   batched query per relation or with a single `LEFT JOIN` statement
//! - Named modifiers narrowing relation queries
//! - Graph inserts and upserts: a diff against the persisted graph, planned
//!   into dependency-ordered inserts, patches, deletes, relates and unrelates
//! - `#id` / `#ref` labels and `#ref{label.field}` templates across a graph
//! - Operation hooks and `tracing` based logging
//!
//! The database is reached only through the [`Queryable`] trait.
//!
//! ## Filters
//!
//! ```rust
//! use knit_query::{Filter, FilterValue};
//!
//! let filter = Filter::and([
//!     Filter::equals("species", "dog"),
//!     Filter::keys_in(&["owner_id"], vec![vec![FilterValue::Int(1)], vec![FilterValue::Int(2)]]),
//! ]);
//! let (sql, params) = filter.to_sql();
//! assert_eq!(sql, r#"("species" = $1 AND "owner_id" IN ($2, $3))"#);
//! assert_eq!(params.len(), 3);
//! ```
//!
//! ## Modifiers
//!
//! ```rust
//! use knit_query::{Filter, ModifierRegistry, OrderByField};
//!
//! let modifiers = ModifierRegistry::new()
//!     .with("dogs", |q| q.and_where(Filter::equals("species", "dog")))
//!     .with("by_name", |q| q.order_by.push(OrderByField::asc("name")));
//! assert!(modifiers.contains("dogs"));
//! ```
//!
//! ## Graphs
//!
//! ```rust
//! use knit_query::graph::{Graph, options::UpsertOptions, planner};
//! use knit_schema::{ModelDescriptor, ModelRegistry, RelationDescriptor};
//! use serde_json::json;
//!
//! let registry = ModelRegistry::builder()
//!     .model(
//!         ModelDescriptor::new("Person", "persons")
//!             .relation(RelationDescriptor::has_many("pets", "Animal").related(["owner_id"])),
//!     )
//!     .model(ModelDescriptor::new("Animal", "animals"))
//!     .build()
//!     .unwrap();
//!
//! let graph = Graph::from_json(&registry, "Person", &json!({"name": "A", "pets": [{"name": "Rex"}]})).unwrap();
//! let plan = planner::plan(&registry, None, &graph, &UpsertOptions::insert_graph()).unwrap();
//! assert_eq!(plan.summary(), vec![("insert", 2)]);
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use knit_query::{ErrorCode, QueryError};
//!
//! let err = QueryError::record_not_found("Animal", "(11)");
//! assert_eq!(err.code, ErrorCode::RecordNotFound);
//! assert!(err.is_not_found());
//! ```

pub mod concurrent;
pub mod eager;
pub mod engine;
pub mod error;
pub mod filter;
pub mod graph;
pub mod logging;
pub mod modifier;
pub mod sql;
pub mod traits;
pub mod types;
pub mod value;

pub use concurrent::{ConcurrencyConfig, ConcurrentExecutor, ExecutionStats};
pub use eager::{EagerOptions, EagerResolver};
pub use engine::GraphEngine;
pub use error::{ErrorCode, ErrorContext, QueryError, QueryResult};
pub use filter::{Filter, FilterValue};
pub use graph::executor::{HookChain, OperationHook, PlanExecutor, SharedHook, TracingHook};
pub use graph::index::{GraphIndex, Identity, NodeState};
pub use graph::operation::{FieldSource, NodeRef, Operation, OperationPlan, PersistedParent};
pub use graph::options::{Toggle, UpsertOptions};
pub use graph::refs::{RefState, Reference, ReferenceTable};
pub use graph::{Graph, GraphNode, GraphRelation, NodeId, ParentLink};
pub use logging::{get_log_format, get_log_level, init as init_logging, is_debug_enabled};
pub use modifier::{Modifier, ModifierRegistry, RelationQuery};
pub use sql::{DatabaseType, SqlBuilder};
pub use traits::{BoxFuture, Queryable};
pub use types::{OrderBy, OrderByField, Select, SortOrder};
pub use value::{IdentityKey, Record, values_equal};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::engine::GraphEngine;
    pub use crate::error::{QueryError, QueryResult};
    pub use crate::filter::{Filter, FilterValue};
    pub use crate::graph::executor::{OperationHook, TracingHook};
    pub use crate::graph::operation::{Operation, OperationPlan};
    pub use crate::graph::options::{Toggle, UpsertOptions};
    pub use crate::modifier::{ModifierRegistry, RelationQuery};
    pub use crate::traits::{BoxFuture, Queryable};
    pub use crate::types::{OrderBy, OrderByField, Select};
    pub use crate::value::Record;
    pub use knit_schema::{EagerStrategy, KnitConfig, ModelDescriptor, ModelRegistry, RelationDescriptor};
}
