//! Configuration file parsing for `knit.toml`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{SchemaError, SchemaResult};

/// Main configuration structure for `knit.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KnitConfig {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Eager loading settings.
    #[serde(default)]
    pub eager: EagerConfig,

    /// Default graph upsert options.
    #[serde(default)]
    pub upsert: UpsertConfig,

    /// Debug/logging settings.
    #[serde(default)]
    pub debug: DebugConfig,

    /// Environment-specific overrides.
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentOverride>,
}

impl KnitConfig {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> SchemaResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| SchemaError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> SchemaResult<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| SchemaError::TomlError { source: e })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-specific overrides.
    pub fn with_environment(mut self, env: &str) -> Self {
        if let Some(overrides) = self.environments.remove(env) {
            if let Some(eager) = overrides.eager {
                if let Some(strategy) = eager.strategy {
                    self.eager.strategy = strategy;
                }
                if let Some(concurrency) = eager.concurrency {
                    self.eager.concurrency = concurrency;
                }
                if let Some(batch_size) = eager.batch_size {
                    self.eager.batch_size = batch_size;
                }
            }
            if let Some(debug) = overrides.debug {
                if let Some(log_queries) = debug.log_queries {
                    self.debug.log_queries = log_queries;
                }
            }
        }
        self
    }

    fn validate(&self) -> SchemaResult<()> {
        if self.eager.concurrency == 0 {
            return Err(SchemaError::ConfigError {
                message: "eager.concurrency must be at least 1".to_string(),
            });
        }
        if self.eager.batch_size == 0 {
            return Err(SchemaError::ConfigError {
                message: "eager.batch_size must be at least 1".to_string(),
            });
        }
        if self.eager.max_recursion_depth == 0 {
            return Err(SchemaError::ConfigError {
                message: "eager.max_recursion_depth must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Database configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQL dialect; only the placeholder style depends on it.
    #[serde(default)]
    pub dialect: Dialect,
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL (`$1`, `$2`, ...).
    #[default]
    #[serde(alias = "postgres")]
    PostgreSql,
    /// MySQL (`?`).
    MySql,
    /// SQLite (`?`).
    #[serde(alias = "sqlite3")]
    Sqlite,
}

impl Dialect {
    /// Get the dialect name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostgreSql => "postgresql",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Eager loading strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EagerStrategy {
    /// One batched query per relation.
    #[default]
    Naive,
    /// One statement of nested left joins.
    Join,
}

/// Eager loading configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EagerConfig {
    /// Default strategy.
    #[serde(default)]
    pub strategy: EagerStrategy,

    /// Maximum concurrent relation queries.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum keys per `IN (...)` list.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Levels an infinite recursion is expanded to.
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: u32,
}

impl Default for EagerConfig {
    fn default() -> Self {
        Self {
            strategy: EagerStrategy::default(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            max_recursion_depth: default_max_recursion_depth(),
        }
    }
}

fn default_concurrency() -> usize { 4 }
fn default_batch_size() -> usize { 500 }
fn default_max_recursion_depth() -> u32 { 16 }

/// Default switches for graph upserts.
///
/// Each switch applies to every relation; per-relation paths are set in code.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpsertConfig {
    /// Relate rows that carry an unknown primary key instead of inserting them.
    #[serde(default)]
    pub relate: bool,

    /// Unrelate missing rows instead of deleting them.
    #[serde(default)]
    pub unrelate: bool,

    /// Insert rows that carry an unknown primary key.
    #[serde(default = "default_true")]
    pub insert_missing: bool,

    /// Never delete or unrelate missing rows.
    #[serde(default)]
    pub no_delete: bool,

    /// Never insert new rows.
    #[serde(default)]
    pub no_insert: bool,

    /// Never update matched rows.
    #[serde(default)]
    pub no_update: bool,

    /// Allow `#ref{..}` templates in upserts.
    #[serde(default)]
    pub allow_refs: bool,

    /// Match keyless rows to persisted rows by position.
    #[serde(default)]
    pub match_by_position: bool,
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self {
            relate: false,
            unrelate: false,
            insert_missing: true,
            no_delete: false,
            no_insert: false,
            no_update: false,
            allow_refs: false,
            match_by_position: false,
        }
    }
}

fn default_true() -> bool { true }

/// Debug/logging configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    /// Log every generated statement.
    #[serde(default)]
    pub log_queries: bool,
}

/// Environment-specific configuration overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentOverride {
    /// Eager loading overrides.
    pub eager: Option<EagerOverride>,

    /// Debug overrides.
    pub debug: Option<DebugOverride>,
}

/// Eager loading overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EagerOverride {
    /// Override the strategy.
    pub strategy: Option<EagerStrategy>,

    /// Override the concurrency limit.
    pub concurrency: Option<usize>,

    /// Override the batch size.
    pub batch_size: Option<usize>,
}

/// Debug configuration overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DebugOverride {
    /// Override log_queries.
    pub log_queries: Option<bool>,
}

static ENV_VAR: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern")
});

/// Expand environment variables in the format `${VAR_NAME}`.
///
/// Unset variables are left as written.
fn expand_env_vars(content: &str) -> String {
    ENV_VAR
        .replace_all(content, |caps: &regex_lite::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
