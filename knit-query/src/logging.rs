//! Logging setup for Knit.
//!
//! All crates log through `tracing`. Output is only installed by [`init`],
//! and only when the `tracing-subscriber` feature is enabled; otherwise the
//! application's own subscriber receives the events.
//!
//! # Environment Variables
//!
//! - `KNIT_DEBUG=true|1|yes` - Enable debug logging
//! - `KNIT_LOG_LEVEL=trace|debug|info|warn|error` - Set a specific level
//! - `KNIT_LOG_FORMAT=json|pretty|compact` - Set output format (default: json)
//!
//! # Usage
//!
//! ```rust,no_run
//! use knit_query::logging;
//!
//! // Call once at startup
//! logging::init();
//! ```
//!
//! Generated SQL is logged at `debug` under the `knit::sql` target, strategy
//! decisions at `debug`, per-row folding at `trace`.

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Target used for statement logging.
pub const SQL_TARGET: &str = "knit::sql";

/// Check if debug logging is enabled via `KNIT_DEBUG`.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var("KNIT_DEBUG")
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

/// Get the configured log level.
///
/// `KNIT_LOG_LEVEL` wins; otherwise "debug" if `KNIT_DEBUG` is set, else "warn".
pub fn get_log_level() -> &'static str {
    parse_level(env::var("KNIT_LOG_LEVEL").ok().as_deref(), is_debug_enabled())
}

/// Get the configured log format. Defaults to "json".
pub fn get_log_format() -> &'static str {
    parse_format(env::var("KNIT_LOG_FORMAT").ok().as_deref())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_level(level: Option<&str>, debug: bool) -> &'static str {
    let fallback = if debug { "debug" } else { "warn" };
    match level.map(str::to_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") => "warn",
        Some("error") => "error",
        _ => fallback,
    }
}

fn parse_format(format: Option<&str>) -> &'static str {
    match format.map(str::to_lowercase).as_deref() {
        Some("pretty") => "pretty",
        Some("compact") => "compact",
        _ => "json",
    }
}

/// Initialize the Knit logging system.
///
/// Subsequent calls are no-ops. Nothing is installed unless `KNIT_DEBUG` or
/// `KNIT_LOG_LEVEL` is set.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var("KNIT_LOG_LEVEL").is_err() {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let level = get_log_level();
            let filter = EnvFilter::try_new(format!(
                "knit={level},knit_orm={level},knit_query={level},knit_schema={level}"
            ))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

            // try_init: the application may already own the global subscriber
            let installed = match get_log_format() {
                "json" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init(),
                "compact" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().compact())
                    .try_init(),
                _ => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().pretty())
                    .try_init(),
            };

            if installed.is_ok() {
                tracing::info!(level = level, format = get_log_format(), "Knit logging initialized");
            }
        }
    });
}

/// Log a statement about to be sent to the database.
///
/// Always emitted at `trace`; promoted to `debug` when `log_queries` is set
/// in the configuration or `KNIT_DEBUG` is enabled.
pub fn log_statement(log_queries: bool, sql: &str, params: usize) {
    if log_queries || is_debug_enabled() {
        tracing::debug!(target: SQL_TARGET, params, "{sql}");
    } else {
        tracing::trace!(target: SQL_TARGET, params, "{sql}");
    }
}

/// Debug logging that only fires when `KNIT_DEBUG` is enabled at runtime.
#[macro_export]
macro_rules! knit_debug {
    ($($arg:tt)*) => {
        if $crate::logging::is_debug_enabled() {
            tracing::debug!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("1"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("off"));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(None, false), "warn");
        assert_eq!(parse_level(None, true), "debug");
        assert_eq!(parse_level(Some("TRACE"), false), "trace");
        assert_eq!(parse_level(Some("loud"), false), "warn");
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format(None), "json");
        assert_eq!(parse_format(Some("Pretty")), "pretty");
        assert_eq!(parse_format(Some("compact")), "compact");
        assert_eq!(parse_format(Some("xml")), "json");
    }
}
