//! Log output for the watcher.
//!
//! The daemon (`start`) writes one JSON object per event to
//! `<config dir>/logs/moltbot-watcher.log.YYYY-MM-DD`, rotated at UTC
//! midnight, and mirrors human-readable lines to stderr. That file is the
//! audit trail: every alert dispatched, every operator command (including
//! dropped unauthorized ones) and every `/kill` outcome lands there.
//!
//! `check` logs to stderr only.
//!
//! `RUST_LOG` overrides [`DEFAULT_FILTER`]. An unparsable value falls back to
//! the default and is logged as a warning once the subscriber is installed.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Prefix of the rotated log files.
pub const LOG_FILE_PREFIX: &str = "moltbot-watcher.log";

/// Filter used when `RUST_LOG` is unset or invalid. Keeps teloxide polling
/// and sqlx statement logging out of the audit trail.
pub const DEFAULT_FILTER: &str = "info,teloxide=warn,sqlx=warn";

/// Keeps the non-blocking file writer alive; dropping it flushes the log.
#[derive(Debug)]
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// `logs/` under the directory holding `config.toml`.
pub fn logs_dir(config_home: &Path) -> PathBuf {
    config_home.join("logs")
}

/// The file holding events logged on `date` (UTC).
pub fn log_file_for(logs_dir: &Path, date: NaiveDate) -> PathBuf {
    logs_dir.join(format!("{LOG_FILE_PREFIX}.{}", date.format("%Y-%m-%d")))
}

/// Build the level filter from a `RUST_LOG` value.
///
/// Returns the rejected value alongside the default filter when it does not
/// parse.
pub fn filter_from(value: Option<&str>) -> (EnvFilter, Option<String>) {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => match EnvFilter::try_new(v) {
            Ok(filter) => (filter, None),
            Err(_) => (EnvFilter::new(DEFAULT_FILTER), Some(v.to_owned())),
        },
        None => (EnvFilter::new(DEFAULT_FILTER), None),
    }
}

fn env_filter() -> (EnvFilter, Option<String>) {
    let value = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    filter_from(value.as_deref())
}

fn report_rejected(rejected: Option<String>) {
    if let Some(value) = rejected {
        warn!(value = %value, default = DEFAULT_FILTER, "ignoring invalid RUST_LOG");
    }
}

/// Start daemon logging into `logs_dir`.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_daemon(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let (filter, rejected) = env_filter();

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(non_blocking);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(console_layer)
        .init();

    report_rejected(rejected);
    info!(logs_dir = %logs_dir.display(), "audit log opened");

    Ok(LoggingGuard { _guard: guard })
}

/// Start stderr-only logging for `check`.
pub fn init_cli() {
    let (filter, rejected) = env_filter();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    report_rejected(rejected);
}
