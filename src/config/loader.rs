use std::{collections::HashMap, path::Path};

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Prefix for environment overrides, e.g. `GATEWAY__RETRY__MAX_ATTEMPTS=2`.
pub const ENV_PREFIX: &str = "GATEWAY";
/// Separator between nested keys in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

/// Load configuration from an optional file layered under `GATEWAY__*` environment variables.
/// Supports multiple file formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously from the file and the process environment
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    load_config_with_env(config_path, None)
}

/// Load configuration with an explicit environment map instead of the process environment.
///
/// `None` reads the real environment. A missing config file is not an error: every field
/// has a default and services can be declared purely through the environment.
pub fn load_config_with_env(
    config_path: &str,
    env: Option<HashMap<String, String>>,
) -> Result<GatewayConfig> {
    let path = Path::new(config_path);

    // Determine file format based on extension
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let file_name = path
        .to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?;

    let settings = Config::builder()
        .add_source(File::new(file_name, format).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let gateway_config: GatewayConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(gateway_config)
}
