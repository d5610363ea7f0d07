//! Configuration loader and validator for the nickname sync bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub discord: Discord,
    pub bungie: Bungie,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub sync_interval_secs: u64,
}

/// Discord bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Discord {
    pub bot_token: String,
}

/// Bungie API and OAuth application settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bungie {
    pub api_key: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_secs must be > 0"));
    }

    if cfg.discord.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("discord.bot_token must be non-empty"));
    }

    if cfg.bungie.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("bungie.api_key must be non-empty"));
    }
    if cfg.bungie.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("bungie.client_id must be non-empty"));
    }
    if cfg.bungie.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("bungie.client_secret must be non-empty"));
    }

    Ok(())
}

/// Example configuration, used by tests and as a starting point for a new
/// deployment.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_secs: 60

discord:
  bot_token: "YOUR_DISCORD_BOT_TOKEN"

bungie:
  api_key: "YOUR_BUNGIE_API_KEY"
  client_id: "YOUR_OAUTH_CLIENT_ID"
  client_secret: "YOUR_OAUTH_CLIENT_SECRET"
"#
}
