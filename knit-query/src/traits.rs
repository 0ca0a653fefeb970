//! The database seam.
//!
//! Knit never owns a connection. Callers hand in anything implementing
//! [`Queryable`]: a pool, a transaction, or a scripted mock in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::QueryResult;
use crate::filter::FilterValue;
use crate::value::Record;

/// A boxed future that can be sent across threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Executes SQL and reports table columns.
///
/// `run_query` is used for every statement, including writes; `INSERT`s are
/// issued with `RETURNING *` and must yield the inserted row.
pub trait Queryable: Send + Sync {
    /// Run a statement and return its rows (empty for statements without rows).
    fn run_query(&self, sql: &str, params: Vec<FilterValue>) -> BoxFuture<'_, QueryResult<Vec<Record>>>;

    /// Column names of `table` in declaration order.
    fn fetch_columns(&self, table: &str) -> BoxFuture<'_, QueryResult<Vec<String>>>;
}

impl<T: Queryable + ?Sized> Queryable for &T {
    fn run_query(&self, sql: &str, params: Vec<FilterValue>) -> BoxFuture<'_, QueryResult<Vec<Record>>> {
        (**self).run_query(sql, params)
    }

    fn fetch_columns(&self, table: &str) -> BoxFuture<'_, QueryResult<Vec<String>>> {
        (**self).fetch_columns(table)
    }
}

impl<T: Queryable + ?Sized> Queryable for Arc<T> {
    fn run_query(&self, sql: &str, params: Vec<FilterValue>) -> BoxFuture<'_, QueryResult<Vec<Record>>> {
        (**self).run_query(sql, params)
    }

    fn fetch_columns(&self, table: &str) -> BoxFuture<'_, QueryResult<Vec<String>>> {
        (**self).fetch_columns(table)
    }
}
