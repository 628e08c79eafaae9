//! Logging for geotrail
//!
//! Logs go to `$XDG_STATE_HOME/geotrail/geotrail.YYYY-MM-DD.log`, one file per
//! UTC day. The base level comes from `[logging] level`; individual pipeline
//! components can be turned up or down under `[logging.components]`:
//!
//! ```toml
//! [logging]
//! level = "info"
//! components = { uploader = "debug", queue = "warn" }
//! ```
//!
//! `RUST_LOG` replaces the whole filter when set.

use std::path::PathBuf;

use chrono::Utc;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

/// Components that accept a level under `[logging.components]`
pub const COMPONENTS: &[&str] = &[
    "auth",
    "pipeline",
    "queue",
    "reachability",
    "store",
    "transport",
    "trigger",
    "uploader",
];

/// The HTTP stack logs every connection at debug; keep it out of the file
/// unless asked for explicitly.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Filter directives for `config`, base level first.
pub fn filter_directives(config: &LoggingConfig) -> Result<Vec<String>> {
    let mut directives = vec![config.level.clone()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()));

    for (component, level) in &config.components {
        if !COMPONENTS.contains(&component.as_str()) {
            return Err(Error::Config(format!(
                "unknown logging component '{}' (expected one of: {})",
                component,
                COMPONENTS.join(", ")
            )));
        }
        directives.push(format!("geotrail_core::{}={}", component, level));
    }

    Ok(directives)
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = filter_directives(config)?.join(",");
    EnvFilter::builder()
        .parse(&directives)
        .map_err(|e| Error::Config(format!("invalid logging level in '{}': {}", directives, e)))
}

/// Install the file logger. Keep the returned guard alive for the whole run.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = build_filter(config)?;
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("geotrail")
        .filename_suffix("log")
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;

    // Upload and persist paths must never wait on the disk for a log line
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install log subscriber: {}", e)))?;

    tracing::info!(
        log_file = %log_file_path().display(),
        level = %config.level,
        components = ?config.components,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Route logs to the test harness's captured output.
///
/// Defaults to debug for this crate when `RUST_LOG` is unset. Safe to call
/// from every test.
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,geotrail_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Flushes buffered log lines when dropped
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Today's log file
pub fn log_file_path() -> PathBuf {
    Config::log_path(Utc::now().date_naive())
}
