//! `tether-config`: plugin host configuration.
//!
//! Provides:
//! - Typed config schema (plugin discovery, sessions, debug mode, logging)
//! - YAML read and atomic write
//! - `${ENV_VAR}` substitution
//! - Default value application
//! - Validation with errors and warnings

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_config, write_config};
pub use schema::{DebugConfig, HostConfig, LoggingConfig, PluginsConfig};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;

/// Load a config file, substitute env vars, apply defaults and validate.
///
/// Validation warnings are logged; any validation error fails the load.
pub async fn load_and_prepare(path: &Path) -> Result<HostConfig> {
    let raw_config = load_config(path).await?;
    let value: Value =
        serde_json::to_value(&raw_config).context("Failed to serialize config for processing")?;
    let value = resolve_env_vars(&value).context("Failed to resolve env vars in config")?;
    prepare(value)
}

fn prepare(value: Value) -> Result<HostConfig> {
    let config: HostConfig =
        serde_json::from_value(value).context("Failed to deserialize config after processing")?;
    let config = apply_all_defaults(config);

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if let Some(first) = report.errors.into_iter().next() {
        bail!(first);
    }
    Ok(config)
}
