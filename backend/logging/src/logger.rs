//! Structured Logger
//!
//! Wraps `tracing` with a console layer, a daily-rolling NDJSON file layer and
//! environment-based level control.

use std::path::Path;

use anyhow::{Context, Result};
use tether_core::protocol::LogLevel;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global logger. `RUST_LOG` wins over `level`.
///
/// Calling it again after a subscriber is installed is a no-op.
pub fn init_logger<P: AsRef<Path>>(log_dir: P, level: &str, json_console: bool) -> Result<()> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Writes `tether.log.YYYY-MM-DD`
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "tether.log");
    let file_layer = fmt::layer()
        .json()
        .with_writer(file_appender)
        .with_ansi(false);

    let json_layer = json_console.then(|| fmt::layer().json().with_writer(std::io::stdout));
    let text_layer = (!json_console).then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(true)
            .with_ansi(true)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}

/// Minimum level a launched plugin should log at, derived from the host level.
pub fn plugin_log_level(host_level: &str) -> LogLevel {
    match host_level.trim().to_ascii_lowercase().as_str() {
        "trace" => LogLevel::Trace,
        "debug" => LogLevel::Debug,
        "warn" | "warning" => LogLevel::Warning,
        "error" => LogLevel::Error,
        "off" | "none" => LogLevel::None,
        _ => LogLevel::Information,
    }
}

/// `tracing` level for a plugin log level; `None` drops the record.
pub fn tracing_level(level: LogLevel) -> Option<Level> {
    match level {
        LogLevel::Trace => Some(Level::TRACE),
        LogLevel::Debug => Some(Level::DEBUG),
        LogLevel::Information => Some(Level::INFO),
        LogLevel::Warning => Some(Level::WARN),
        LogLevel::Error | LogLevel::Critical => Some(Level::ERROR),
        LogLevel::None => None,
    }
}
