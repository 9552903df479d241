//! Structured logging for the plugin host.
//!
//! Sets up the global subscriber, maps plugin log levels and forwards plugin
//! log records and child process output into the host's log.

pub mod logger;
pub mod plugin_log;
pub mod redact;

pub use logger::{init_logger, plugin_log_level, tracing_level};
pub use plugin_log::{OutputStream, emit_plugin_record, format_template, forward_output_line};
pub use redact::{redact_command_line, redact_token};
