//! Plugin host configuration schema.
//!
//! Every field is optional on disk; [`crate::defaults`] fills in the gaps and
//! the accessor methods give the effective values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::defaults::{
    DEFAULT_DEBUG_REGISTRATION_TIMEOUT_SECS, DEFAULT_LOG_LEVEL, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_REGISTRATION_TIMEOUT_SECS,
};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<PluginsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl HostConfig {
    /// Plugins section, or an empty one.
    pub fn plugins(&self) -> PluginsConfig {
        self.plugins.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginsConfig {
    /// Directories scanned for plugin files, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<PathBuf>,

    /// Where function signature caches are kept. No caching when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_timeout_secs: Option<u64>,

    /// Upper bound of pooled sessions per plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    /// Fixed listening endpoint (`unix:///path` or `tcp://host:port`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_endpoint: Option<String>,

    /// Directory searched first for the plugins proxy executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_search_paths: Vec<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_remote_calls: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugConfig>,
}

impl PluginsConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(
            self.registration_timeout_secs
                .unwrap_or(DEFAULT_REGISTRATION_TIMEOUT_SECS),
        )
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS) as usize
    }

    pub fn log_remote_calls(&self) -> bool {
        self.log_remote_calls.unwrap_or(false)
    }

    /// Debug section if debug mode is switched on.
    pub fn active_debug(&self) -> Option<&DebugConfig> {
        self.debug.as_ref().filter(|d| d.enabled.unwrap_or(false))
    }
}

/// Plugin development mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Fixed token an externally started plugin registers with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_timeout_secs: Option<u64>,

    /// Create the token but never start the plugin process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_plugins_execution: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_forever: Option<bool>,
}

impl DebugConfig {
    /// `None` means wait without a deadline.
    pub fn registration_timeout(&self) -> Option<Duration> {
        if self.wait_forever.unwrap_or(false) {
            return None;
        }
        Some(Duration::from_secs(
            self.registration_timeout_secs
                .unwrap_or(DEFAULT_DEBUG_REGISTRATION_TIMEOUT_SECS),
        ))
    }

    pub fn skip_execution(&self) -> bool {
        self.skip_plugins_execution.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn`, `error` or `off`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Emit console output as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_yaml() {
        let yaml = r#"
plugins:
  directories: ["/opt/plugins"]
  registrationTimeoutSecs: 5
  maxConnections: 2
  debug:
    enabled: true
    waitForever: true
logging:
  level: debug
"#;
        let config: HostConfig = serde_yaml::from_str(yaml).unwrap();
        let plugins = config.plugins();
        assert_eq!(plugins.directories, vec![PathBuf::from("/opt/plugins")]);
        assert_eq!(plugins.registration_timeout(), Duration::from_secs(5));
        assert_eq!(plugins.max_connections(), 2);
        assert_eq!(plugins.active_debug().unwrap().registration_timeout(), None);
        assert_eq!(config.logging().level(), "debug");
    }

    #[test]
    fn disabled_debug_section_is_inactive() {
        let plugins = PluginsConfig {
            debug: Some(DebugConfig {
                token: Some("dev".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(plugins.active_debug().is_none());
    }
}
