//! Config validation with path-tagged errors and warnings.

use crate::schema::{HostConfig, LoggingConfig, PluginsConfig};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

pub fn validate(config: &HostConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    if let Some(plugins) = &config.plugins {
        validate_plugins(plugins, &mut report);
    }
    if let Some(logging) = &config.logging {
        validate_logging(logging, &mut report);
    }
    report
}

fn validate_plugins(plugins: &PluginsConfig, report: &mut ValidationReport) {
    if plugins.directories.is_empty() {
        report.warn("plugins.directories", "No plugin directories configured");
    }
    if plugins.registration_timeout_secs == Some(0) {
        report.error("plugins.registrationTimeoutSecs", "registrationTimeoutSecs must be > 0");
    }
    if plugins.max_connections == Some(0) {
        report.error("plugins.maxConnections", "maxConnections must be >= 1");
    }
    if let Some(endpoint) = &plugins.server_endpoint {
        if !endpoint.starts_with("unix://") && !endpoint.starts_with("tcp://") {
            report.error(
                "plugins.serverEndpoint",
                format!("Unsupported endpoint '{endpoint}'. Use 'unix:///path' or 'tcp://host:port'"),
            );
        }
    }

    let Some(debug) = &plugins.debug else { return };
    let enabled = debug.enabled.unwrap_or(false);
    if debug.registration_timeout_secs == Some(0) && debug.wait_forever != Some(true) {
        report.error(
            "plugins.debug.registrationTimeoutSecs",
            "registrationTimeoutSecs must be > 0 unless waitForever is set",
        );
    }
    if enabled && debug.skip_execution() && debug.token.as_deref().map(str::is_empty).unwrap_or(true) {
        report.error(
            "plugins.debug.token",
            "A fixed token is required when skipPluginsExecution is set",
        );
    }
    if !enabled && (debug.skip_execution() || debug.wait_forever == Some(true)) {
        report.warn("plugins.debug.enabled", "Debug options are ignored while debug is disabled");
    }
}

fn validate_logging(logging: &LoggingConfig, report: &mut ValidationReport) {
    if let Some(level) = &logging.level {
        if !matches!(
            level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        ) {
            report.error(
                "logging.level",
                format!("Unknown log level '{level}'. Use trace, debug, info, warn, error or off"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::apply_all_defaults;
    use crate::schema::DebugConfig;

    #[test]
    fn defaulted_config_is_valid() {
        let report = validate(&apply_all_defaults(HostConfig::default()));
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn zero_timeout_and_connections_are_errors() {
        let cfg = HostConfig {
            plugins: Some(PluginsConfig {
                registration_timeout_secs: Some(0),
                max_connections: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let report = validate(&cfg);
        let paths: Vec<_> = report.errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["plugins.registrationTimeoutSecs", "plugins.maxConnections"]);
    }

    #[test]
    fn skip_execution_needs_token() {
        let cfg = HostConfig {
            plugins: Some(PluginsConfig {
                debug: Some(DebugConfig {
                    enabled: Some(true),
                    skip_plugins_execution: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let report = validate(&cfg);
        assert!(report.errors.iter().any(|e| e.path == "plugins.debug.token"));
    }

    #[test]
    fn rejects_unknown_endpoint_scheme() {
        let cfg = HostConfig {
            plugins: Some(PluginsConfig {
                directories: vec!["/opt".into()],
                server_endpoint: Some("pipe://x".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!validate(&cfg).is_valid());
    }
}
