//! Default values applied to a freshly parsed config.

use crate::schema::{HostConfig, LoggingConfig, PluginsConfig};

/// Seconds to wait for a launched plugin to register.
pub const DEFAULT_REGISTRATION_TIMEOUT_SECS: u64 = 10;

/// Registration wait in debug mode, long enough to attach a debugger.
pub const DEFAULT_DEBUG_REGISTRATION_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub fn apply_all_defaults(config: HostConfig) -> HostConfig {
    let config = apply_plugins_defaults(config);
    apply_logging_defaults(config)
}

fn apply_plugins_defaults(mut config: HostConfig) -> HostConfig {
    let plugins = config.plugins.get_or_insert_with(PluginsConfig::default);
    if plugins.registration_timeout_secs.is_none() {
        plugins.registration_timeout_secs = Some(DEFAULT_REGISTRATION_TIMEOUT_SECS);
    }
    if plugins.max_connections.is_none() {
        plugins.max_connections = Some(DEFAULT_MAX_CONNECTIONS);
    }
    if plugins.log_remote_calls.is_none() {
        plugins.log_remote_calls = Some(false);
    }
    if let Some(debug) = &mut plugins.debug {
        if debug.registration_timeout_secs.is_none() {
            debug.registration_timeout_secs = Some(DEFAULT_DEBUG_REGISTRATION_TIMEOUT_SECS);
        }
    }
    config
}

fn apply_logging_defaults(mut config: HostConfig) -> HostConfig {
    let logging = config.logging.get_or_insert_with(LoggingConfig::default);
    if logging.level.is_none() {
        logging.level = Some(DEFAULT_LOG_LEVEL.to_string());
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DebugConfig;

    #[test]
    fn fills_plugin_defaults() {
        let cfg = apply_all_defaults(HostConfig::default());
        let plugins = cfg.plugins.unwrap();
        assert_eq!(plugins.registration_timeout_secs, Some(10));
        assert_eq!(plugins.max_connections, Some(DEFAULT_MAX_CONNECTIONS));
        assert_eq!(cfg.logging.unwrap().level.as_deref(), Some("info"));
    }

    #[test]
    fn keeps_user_values_and_extends_debug_timeout() {
        let cfg = HostConfig {
            plugins: Some(PluginsConfig {
                max_connections: Some(1),
                debug: Some(DebugConfig {
                    enabled: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let plugins = apply_all_defaults(cfg).plugins.unwrap();
        assert_eq!(plugins.max_connections, Some(1));
        assert_eq!(plugins.debug.unwrap().registration_timeout_secs, Some(600));
    }
}
