use config::{Config, Environment, File};
use identity::config::IdentityConfig;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Prefix of environment overrides, e.g. `AZOAUTH__IDENTITY__TENANT_ID`.
pub const ENV_PREFIX: &str = "AZOAUTH";
const DEFAULT_CONFIG_NAME: &str = "azoauth";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Configuration loading failed: {0}. Please check your azoauth.toml file and environment variables."
    )]
    Load(String),
    #[error("Failed to deserialize config: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    identity: IdentityConfig,
}

impl AppConfig {
    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    level: String,
    #[serde(default)]
    file: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }
}

/// Loads `azoauth.toml` from the working directory when present, or `path`
/// when given, then applies `.env` and `AZOAUTH__*` overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    dotenv::dotenv().ok();
    load_from(path, ENV_PREFIX)
}

fn load_from(path: Option<&Path>, env_prefix: &str) -> Result<AppConfig, ConfigError> {
    let file_source = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
    };
    let env_source = Environment::with_prefix(env_prefix)
        .separator("__")
        .try_parsing(true);

    let config = Config::builder()
        .add_source(file_source)
        .add_source(env_source)
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    config
        .try_deserialize::<AppConfig>()
        .map_err(|e| ConfigError::Deserialize(e.to_string()))
}
