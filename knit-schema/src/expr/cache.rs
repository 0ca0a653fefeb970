//! Parse cache for relation expressions.
//!
//! Expression strings are usually literals repeated on every request, so
//! parsed trees are cached by their exact source text and handed out as
//! shared `Arc`s.
//!
//! ```rust
//! use std::sync::Arc;
//! use knit_schema::expr::ExpressionCache;
//!
//! let cache = ExpressionCache::new();
//! let a = cache.get_or_parse("children.pets").unwrap();
//! let b = cache.get_or_parse("children.pets").unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//! assert_eq!(cache.stats().hits, 1);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use smol_str::SmolStr;

use super::node::RelationExpression;
use super::parser::parse_expression;
use crate::error::SchemaResult;

const DEFAULT_MAX_ENTRIES: usize = 1024;

/// A cache of parsed relation expressions keyed by source text.
#[derive(Debug)]
pub struct ExpressionCache {
    cache: RwLock<HashMap<SmolStr, Arc<RelationExpression>>>,
    stats: RwLock<CacheStats>,
    max_entries: usize,
}

/// Statistics for the expression cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of expressions currently cached.
    pub cached_count: usize,
}

impl CacheStats {
    /// Get the cache hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl Default for ExpressionCache {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }
}

impl ExpressionCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache holding at most `max_entries` expressions.
    ///
    /// A full cache is emptied before the next insert.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            stats: RwLock::default(),
            max_entries: max_entries.max(1),
        }
    }

    /// Get a cached expression or parse and cache it.
    ///
    /// Parse errors are not cached.
    pub fn get_or_parse(&self, source: &str) -> SchemaResult<Arc<RelationExpression>> {
        if let Some(expr) = self.cache.read().get(source) {
            self.stats.write().hits += 1;
            return Ok(Arc::clone(expr));
        }

        let expr = Arc::new(parse_expression(source)?);

        {
            let mut cache = self.cache.write();
            if cache.len() >= self.max_entries {
                tracing::debug!(entries = cache.len(), "expression cache full, clearing");
                cache.clear();
            }
            cache.insert(SmolStr::new(source), Arc::clone(&expr));
        }
        self.stats.write().misses += 1;

        Ok(expr)
    }

    /// Check if an expression is cached.
    pub fn contains(&self, source: &str) -> bool {
        self.cache.read().contains_key(source)
    }

    /// Clear the cache.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.cached_count = self.cache.read().len();
        stats
    }

    /// Get the number of cached expressions.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

static GLOBAL_CACHE: LazyLock<ExpressionCache> = LazyLock::new(ExpressionCache::new);

/// Parse through the process-wide expression cache.
pub fn parse_cached(source: &str) -> SchemaResult<Arc<RelationExpression>> {
    GLOBAL_CACHE.get_or_parse(source)
}

/// The process-wide expression cache.
pub fn global_cache() -> &'static ExpressionCache {
    &GLOBAL_CACHE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit() {
        let cache = ExpressionCache::new();
        let first = cache.get_or_parse("children.[pets, movies]").unwrap();
        let second = cache.get_or_parse("children.[pets, movies]").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.cached_count, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_errors_not_cached() {
        let cache = ExpressionCache::new();
        assert!(cache.get_or_parse("pets.[").is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_bounded() {
        let cache = ExpressionCache::with_max_entries(2);
        cache.get_or_parse("a").unwrap();
        cache.get_or_parse("b").unwrap();
        cache.get_or_parse("c").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_parse_cached_shares_trees() {
        let a = parse_cached("parent.^").unwrap();
        let b = parse_cached("parent.^").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(global_cache().contains("parent.^"));
    }
}
