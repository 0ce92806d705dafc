//! Tracing setup for nodes: console only, or console plus a rolling file.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when neither the caller nor `RUST_LOG` supplies one.
pub const DEFAULT_FILTER: &str = "info,hive_distributor=debug,hive_retry=debug";

/// Prefix of the daily log files written by [`init_logging_to_dir`].
pub const LOG_FILE_PREFIX: &str = "distributor";

/// `RUST_LOG` if set, otherwise `fallback`. A malformed fallback is an error
/// rather than a silently ignored directive.
fn resolve_filter(fallback: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(from_env) => Ok(from_env),
        Err(_) => EnvFilter::try_new(fallback)
            .with_context(|| format!("Invalid log filter '{fallback}'")),
    }
}

/// Install a compact console subscriber.
pub fn init_logging(filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(resolve_filter(filter)?)
        .with(fmt::layer().with_target(true).compact())
        .try_init()
        .context("Failed to initialize logging")
}

/// Log to the console and to a daily-rolling file in `logs_dir`.
/// Keep the returned guard alive for as long as the node runs.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Cannot create log directory {}", logs_dir.display()))?;
    let env_filter = resolve_filter(filter)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; the directory is created
        // either way.
        let result = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());
        drop(result);
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let first = init_logging(DEFAULT_FILTER);
        let second = init_logging(DEFAULT_FILTER);
        assert!(!(first.is_ok() && second.is_ok()));
        if let Err(e) = second {
            assert!(e.to_string().contains("logging"), "unexpected error: {e}");
        }
    }

    #[test]
    fn test_default_filter_parses() {
        let filter = EnvFilter::try_new(DEFAULT_FILTER).expect("default filter must parse");
        let rendered = filter.to_string();
        assert!(rendered.contains("hive_distributor=debug"), "got {rendered}");
        assert!(rendered.contains("hive_retry=debug"), "got {rendered}");
    }

    #[test]
    fn test_malformed_filter_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(resolve_filter("hive_distributor=loud").is_err());
        assert!(resolve_filter(DEFAULT_FILTER).is_ok());
    }
}
