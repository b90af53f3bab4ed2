//! Logging setup
//!
//! Console output for operators plus an optional rolling file for
//! collectors. `RUST_LOG` overrides the configured filter wholesale.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LogConfig;

/// Filter applied when `RUST_LOG` is unset. sqlx logs every statement at
/// debug and the ledger issues several per scope, so sqlx, along with the
/// poller's HTTP internals, is capped at warn to keep the ledger's own
/// spans readable.
fn default_filter(level: &str) -> String {
    format!("{level},sqlx=warn,hyper=warn,reqwest=warn")
}

/// Initialize the subscriber. Returns the flush guard for the file writer
/// (`None` when no log directory is configured); hold it for the process
/// lifetime or buffered lines are lost on exit.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.log_level)));

    let console = fmt::layer().with_target(false).with_ansi(true);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    if config.log_dir.is_empty() {
        registry.init();
        return None;
    }

    let appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        other => {
            if !other.is_empty() && other != "never" {
                eprintln!("unknown log rotation {other:?}, writing a single file");
            }
            tracing_appender::rolling::never(&config.log_dir, &config.log_file)
        }
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    // The file sink carries targets either way; JSON is for collectors,
    // the console above stays human-readable regardless.
    if config.use_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init();
    }

    Some(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_caps_noisy_dependencies() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("sqlx=warn"));
        assert!(filter.contains("hyper=warn"));
        assert!(filter.contains("reqwest=warn"));
    }
}
