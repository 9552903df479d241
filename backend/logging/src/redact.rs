//! Log Redaction
//!
//! Registration tokens authenticate plugins and must not show up in logs.

use regex::Regex;
use std::sync::LazyLock;

static TOKEN_ARG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(--token=)(\S+)").expect("static regex"));

/// Keep the first four characters of a token.
pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}…")
}

/// Redact `--token=` values inside a command line.
pub fn redact_command_line(line: &str) -> String {
    TOKEN_ARG_RE
        .replace_all(line, |caps: &regex::Captures| {
            format!("{}{}", &caps[1], redact_token(&caps[2]))
        })
        .into_owned()
}
