//! Plugin Log Forwarding
//!
//! Records received from plugins (through the `Log` call or their standard
//! streams) are re-emitted under the `tether::plugin` target.

use tether_core::protocol::LogLevel;
use tracing::{debug, error, info, trace, warn};

use crate::redact::redact_command_line;

/// Standard stream of a child plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Fill `{placeholder}` holes of a message template with `args` in order.
///
/// `{{` and `}}` are literal braces. Holes without a matching argument are
/// kept verbatim.
pub fn format_template(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => match template[i..].find('}') {
                Some(len) => {
                    let hole = &template[i..i + len + 1];
                    match args.next() {
                        Some(arg) => out.push_str(arg),
                        None => out.push_str(hole),
                    }
                    // Skip the rest of the hole.
                    while let Some((j, _)) = chars.peek() {
                        if *j > i + len {
                            break;
                        }
                        chars.next();
                    }
                }
                None => out.push(c),
            },
            _ => out.push(c),
        }
    }
    out
}

/// Emit a record sent by a plugin through the `Log` call.
pub fn emit_plugin_record(plugin: &str, level: LogLevel, message: &str, args: &[String]) {
    let message = format_template(message, args);
    match level {
        LogLevel::Trace => trace!(target: "tether::plugin", plugin = %plugin, "{message}"),
        LogLevel::Debug => debug!(target: "tether::plugin", plugin = %plugin, "{message}"),
        LogLevel::Information => info!(target: "tether::plugin", plugin = %plugin, "{message}"),
        LogLevel::Warning => warn!(target: "tether::plugin", plugin = %plugin, "{message}"),
        LogLevel::Error | LogLevel::Critical => {
            error!(target: "tether::plugin", plugin = %plugin, "{message}")
        }
        LogLevel::None => {}
    }
}

/// Emit one line a child plugin wrote to stdout (TRACE) or stderr (ERROR).
pub fn forward_output_line(plugin: &str, stream: OutputStream, line: &str) {
    let line = redact_command_line(line.trim_end());
    if line.is_empty() {
        return;
    }
    match stream {
        OutputStream::Stdout => trace!(target: "tether::plugin", plugin = %plugin, "{line}"),
        OutputStream::Stderr => error!(target: "tether::plugin", plugin = %plugin, "{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fills_holes_in_order() {
        let text = format_template("Loaded {Name} with {Count} rows", &args(&["users", "12"]));
        assert_eq!(text, "Loaded users with 12 rows");
    }

    #[test]
    fn keeps_unfilled_holes_and_escapes() {
        let text = format_template("{{literal}} {A} {B}", &args(&["x"]));
        assert_eq!(text, "{literal} x {B}");
    }

    #[test]
    fn unterminated_hole_is_literal() {
        assert_eq!(format_template("open {brace", &args(&["x"])), "open {brace");
    }

    #[test]
    fn emitting_without_subscriber_does_not_panic() {
        emit_plugin_record("p", LogLevel::Critical, "boom {X}", &args(&["1"]));
        forward_output_line("p", OutputStream::Stderr, "line\n");
    }
}
