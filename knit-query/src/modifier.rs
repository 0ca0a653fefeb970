//! Named query modifiers referenced from relation expressions.
//!
//! `pets(onlyDogs)` looks up `onlyDogs` here and applies it to the query that
//! loads `pets`, and only to that query.
//!
//! ```rust
//! use knit_query::modifier::{ModifierRegistry, RelationQuery};
//! use knit_query::filter::Filter;
//! use knit_query::types::OrderByField;
//!
//! let modifiers = ModifierRegistry::new()
//!     .with("onlyDogs", |q: &mut RelationQuery| q.and_where(Filter::equals("species", "dog")))
//!     .with("byName", |q: &mut RelationQuery| q.order_by.push(OrderByField::asc("name")));
//!
//! let query = modifiers.build(None, ["onlyDogs", "byName"]).unwrap();
//! assert!(!query.filter.is_none());
//! assert!(!query.order_by.is_empty());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::error::{QueryError, QueryResult};
use crate::filter::Filter;
use crate::types::{OrderBy, Select};

/// The adjustable parts of a relation's query.
///
/// `limit` caps the rows loaded for each parent row, in `order_by` order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationQuery {
    /// Extra condition on the related rows.
    pub filter: Filter,
    /// Ordering of related rows within each parent.
    pub order_by: OrderBy,
    /// Selected columns; key columns are always added back.
    pub select: Select,
    /// Maximum rows per parent.
    pub limit: Option<u64>,
}

impl RelationQuery {
    /// AND a condition onto the filter.
    pub fn and_where(&mut self, filter: Filter) {
        self.filter = std::mem::take(&mut self.filter).and_then(filter);
    }

    /// Whether the query is unmodified.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// A registered modifier.
pub type Modifier = Arc<dyn Fn(&mut RelationQuery) + Send + Sync>;

/// Name to modifier lookup, shared between clones.
#[derive(Clone, Default)]
pub struct ModifierRegistry {
    modifiers: Arc<RwLock<HashMap<SmolStr, Modifier>>>,
}

impl fmt::Debug for ModifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.modifiers.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("ModifierRegistry").field("modifiers", &names).finish()
    }
}

impl ModifierRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a modifier, builder style.
    pub fn with<F>(self, name: impl Into<SmolStr>, modifier: F) -> Self
    where
        F: Fn(&mut RelationQuery) + Send + Sync + 'static,
    {
        self.register(name, modifier);
        self
    }

    /// Register or replace a modifier.
    pub fn register<F>(&self, name: impl Into<SmolStr>, modifier: F)
    where
        F: Fn(&mut RelationQuery) + Send + Sync + 'static,
    {
        self.modifiers.write().insert(name.into(), Arc::new(modifier));
    }

    /// Look up a modifier.
    pub fn get(&self, name: &str) -> Option<Modifier> {
        self.modifiers.read().get(name).cloned()
    }

    /// Check whether a modifier is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.modifiers.read().contains_key(name)
    }

    /// Apply modifiers in order; the first unknown name fails.
    pub fn apply<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
        query: &mut RelationQuery,
    ) -> QueryResult<()> {
        for name in names {
            let modifier = self.get(name).ok_or_else(|| QueryError::invalid_modifier(name))?;
            modifier(query);
        }
        Ok(())
    }

    /// Build a relation query: the relation's default modifier first, then
    /// the expression's modifiers.
    pub fn build<'a>(
        &self,
        default_modifier: Option<&'a str>,
        names: impl IntoIterator<Item = &'a str>,
    ) -> QueryResult<RelationQuery> {
        let mut query = RelationQuery::default();
        self.apply(default_modifier.into_iter().chain(names), &mut query)?;
        Ok(query)
    }
}
