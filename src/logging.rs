//! Structured logging for the AgroMine services.
//!
//! Stdout always carries a compact subscriber filtered by `RUST_LOG`
//! (default `info`). On top of that, a non-blocking file layer is installed
//! when a writable sink can be resolved. The file sink follows the same
//! per-environment sharding as the interaction store: daily-rotated files
//! named `agromine-test.log` / `agromine-prod.log` under `AGROMINE_LOG_DIR`
//! (default `logs/`), so test and production traffic never mix in one file.
//! `AGROMINE_LOG_FILE` pins an exact path instead; pinned files are appended
//! and never rotated, which suits log collectors that tail a fixed path.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::Environment;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Resolved destination of the file layer.
#[derive(Debug, PartialEq, Eq)]
enum LogSink {
    /// Exact file pinned by `AGROMINE_LOG_FILE`; appended, never rotated.
    Pinned(PathBuf),
    /// Daily-rotated files under a directory, named per environment.
    Rotated {
        /// Directory the rotated files live in.
        directory: PathBuf,
        /// File name stem carrying the environment shard.
        stem: String,
    },
}

/// Install the tracing subscribers for this process.
///
/// The environment decides the file shard the rotated sink writes to; call
/// after configuration is loaded. When no file sink can be opened the
/// process still logs to stdout.
pub fn init_tracing(environment: Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = fmt::layer().with_target(false).compact();
    let registry = tracing_subscriber::registry().with(filter).with(stdout);

    let sink = resolve_sink(
        std::env::var("AGROMINE_LOG_FILE").ok(),
        std::env::var("AGROMINE_LOG_DIR").ok(),
        environment,
    );
    match open_sink(sink) {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

/// Decide where file logs land: a pinned path wins over the sharded
/// directory layout.
fn resolve_sink(
    pinned: Option<String>,
    directory: Option<String>,
    environment: Environment,
) -> LogSink {
    if let Some(path) = pinned.filter(|path| !path.trim().is_empty()) {
        return LogSink::Pinned(path.into());
    }
    LogSink::Rotated {
        directory: directory
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or_else(|| "logs".into())
            .into(),
        stem: format!("agromine-{}.log", environment.table_suffix()),
    }
}

/// Open the sink and keep its worker guard alive for the process lifetime.
fn open_sink(sink: LogSink) -> Option<NonBlocking> {
    let (writer, guard) = match sink {
        LogSink::Pinned(path) => {
            let file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("Failed to open log file {}: {err}", path.display());
                    return None;
                }
            };
            tracing_appender::non_blocking(file)
        }
        LogSink::Rotated { directory, stem } => {
            if let Err(err) = std::fs::create_dir_all(&directory) {
                eprintln!(
                    "Failed to create log directory {}: {err}",
                    directory.display()
                );
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, stem))
        }
    };

    // A second init keeps the first guard; the extra guard would stop its
    // own writer on drop, so only hand out the writer when ours is stored.
    match LOG_GUARD.set(guard) {
        Ok(()) => Some(writer),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_path_wins_over_directory_layout() {
        let sink = resolve_sink(
            Some("/var/log/agromine.log".into()),
            Some("elsewhere".into()),
            Environment::Prod,
        );
        assert_eq!(sink, LogSink::Pinned("/var/log/agromine.log".into()));
    }

    #[test]
    fn rotated_sink_shards_by_environment() {
        let test_sink = resolve_sink(None, None, Environment::Test);
        assert_eq!(
            test_sink,
            LogSink::Rotated {
                directory: "logs".into(),
                stem: "agromine-test.log".into(),
            }
        );

        let prod_sink = resolve_sink(None, Some("/data/logs".into()), Environment::Prod);
        assert_eq!(
            prod_sink,
            LogSink::Rotated {
                directory: "/data/logs".into(),
                stem: "agromine-prod.log".into(),
            }
        );
    }

    #[test]
    fn blank_overrides_fall_back_to_defaults() {
        let sink = resolve_sink(Some("   ".into()), Some("".into()), Environment::Test);
        assert_eq!(
            sink,
            LogSink::Rotated {
                directory: "logs".into(),
                stem: "agromine-test.log".into(),
            }
        );
    }
}
