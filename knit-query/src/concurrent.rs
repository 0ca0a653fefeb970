//! Bounded concurrency for independent queries.
//!
//! Sibling relations are loaded at the same time, but at most
//! `max_concurrency` statements are in flight. Permits are taken around each
//! statement only, so nested loads never wait on a permit their parent holds.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::error::{QueryError, QueryResult};

/// Configuration for concurrent execution.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Maximum number of statements in flight.
    pub max_concurrency: usize,
    /// Timeout for individual statements.
    pub operation_timeout: Option<Duration>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(4),
            operation_timeout: None,
        }
    }
}

impl ConcurrencyConfig {
    /// Set maximum concurrency.
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set statement timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Disable timeout.
    #[must_use]
    pub fn without_timeout(mut self) -> Self {
        self.operation_timeout = None;
        self
    }
}

/// Counters of an executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Statements started.
    pub total: u64,
    /// Statements that succeeded.
    pub successful: u64,
    /// Statements that failed (timeouts included).
    pub failed: u64,
    /// Statements that timed out.
    pub timed_out: u64,
    /// Highest number of statements observed in flight.
    pub max_concurrent: u64,
}

/// Runs statements with a concurrency limit and joins sibling work.
#[derive(Debug, Clone)]
pub struct ConcurrentExecutor {
    config: ConcurrencyConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<StatsCollector>,
}

impl Default for ConcurrentExecutor {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

impl ConcurrentExecutor {
    /// Create a new executor.
    pub fn new(config: ConcurrencyConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            semaphore,
            stats: Arc::new(StatsCollector::default()),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Run one statement once a permit is available.
    pub async fn limited<T, Fut>(&self, task: Fut) -> QueryResult<T>
    where
        Fut: Future<Output = QueryResult<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| QueryError::internal("concurrency limiter closed"))?;
        self.stats.started();

        let result = match self.config.operation_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, task).await {
                Ok(result) => result,
                Err(_) => {
                    self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                    Err(QueryError::database(format!("statement timed out after {timeout:?}")))
                }
            },
            None => task.await,
        };

        self.stats.finished(result.is_ok());
        result
    }

    /// Drive `tasks` concurrently and return their outputs in input order.
    ///
    /// Every task runs to completion; if any failed, the first failure (in
    /// completion order) is returned and the other outputs are discarded.
    pub async fn join_ordered<T, Fut>(&self, tasks: impl IntoIterator<Item = Fut>) -> QueryResult<Vec<T>>
    where
        Fut: Future<Output = QueryResult<T>>,
    {
        let mut futures: FuturesUnordered<_> = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| async move { (index, task.await) })
            .collect();

        let mut results: Vec<Option<T>> = (0..futures.len()).map(|_| None).collect();
        let mut first_error = None;

        while let Some((index, result)) = futures.next().await {
            match result {
                Ok(value) => results[index] = Some(value),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        results
            .into_iter()
            .map(|r| r.ok_or_else(|| QueryError::internal("concurrent task produced no result")))
            .collect()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ExecutionStats {
        self.stats.snapshot()
    }
}

#[derive(Debug, Default)]
struct StatsCollector {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    current: AtomicU64,
    max_concurrent: AtomicU64,
}

impl StatsCollector {
    fn started(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);
    }

    fn finished(&self, ok: bool) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        if ok {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            total: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent.load(Ordering::SeqCst),
        }
    }
}
