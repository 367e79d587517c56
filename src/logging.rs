//! Tracing subscribers for the daemon and the one-shot commands.
//!
//! `logsentinel start` keeps a machine-readable record of its own activity
//! in daily JSON files next to a readable stderr stream. Every other
//! subcommand only writes to stderr. `RUST_LOG` wins over the configured
//! level in both cases.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Daemon log files are named `logsentinel.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "logsentinel.log";

/// Directives appended to the configured level. Per-statement sqlx output
/// would drown the tailer's own events.
const QUIET_DEPENDENCIES: &str = "sqlx=warn";

/// Keeps the background file writer alive. Buffered entries are written
/// out when this is dropped.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

/// Install the daemon subscriber: JSON lines into `logs_dir`, rotated
/// daily, plus plain text on stderr.
///
/// `default_level` applies when `RUST_LOG` is unset or unparsable.
///
/// # Errors
///
/// Fails if `logs_dir` cannot be created or a global subscriber is
/// already installed.
pub fn init_production(logs_dir: &Path, default_level: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (file_writer, writer_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _writer: writer_guard,
    })
}

/// Install a stderr-only subscriber. Keeps any subscriber already present.
pub fn init_cli(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// `RUST_LOG` if set and valid, else `default_level` with noisy crates
/// turned down.
pub fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("{default_level},{QUIET_DEPENDENCIES}"))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    })
}
