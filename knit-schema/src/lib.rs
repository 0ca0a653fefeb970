//! # knit-schema
//!
//! Relation model and relation expressions for the Knit graph engine.
//!
//! This crate provides:
//! - The static relation model ([`ModelRegistry`]) describing entity types,
//!   their keys and their relations
//! - A relation expression parser for strings like `children.[pets, movies.actors]`
//!   plus the equivalent JSON object notation
//! - A parse cache sharing expression trees across requests
//! - Configuration parser for `knit.toml` files
//!
//! ## Example
//!
//! ```rust
//! use knit_schema::{ModelDescriptor, ModelRegistry, RelationDescriptor, parse_expression};
//!
//! let registry = ModelRegistry::builder()
//!     .model(
//!         ModelDescriptor::new("Person", "persons")
//!             .relation(RelationDescriptor::has_many("children", "Person").related(["parent_id"])),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let expr = parse_expression("children.^").unwrap();
//! expr.bind(&registry, "Person").unwrap();
//! ```

pub mod config;
pub mod error;
pub mod expr;
pub mod model;

pub use config::{Dialect, EagerStrategy, KnitConfig};
pub use error::{SchemaError, SchemaResult};
pub use expr::{
    IntoRelationExpression, ModifierCall, Recursion, RelationExpression, parse_cached,
    parse_expression,
};
pub use model::{
    ModelDescriptor, ModelRegistry, RelationDescriptor, RelationKind, ThroughTable,
};
