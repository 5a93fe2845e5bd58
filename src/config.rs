//! Configuration management
//!
//! Two layers:
//! - [`Config`]: process-wide settings from environment variables
//! - [`BotConfig`]: one JSON file per bot personality in the config directory

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::info;

use crate::rate_limit::RateLimitConfig;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the per-bot `*.json` files
    pub config_dir: PathBuf,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Fallback Anthropic API key for bots that don't set their own
    pub anthropic_api_key: Option<String>,

    /// Emit JSON logs on stderr instead of text on stdout
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config_dir = std::env::var("RELAYBOT_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("configs"));

        let db_path = std::env::var("RELAYBOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("relaybot")
                    .join("bot.db")
            });

        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let log_json = std::env::var("RELAYBOT_LOG_JSON")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            config_dir,
            db_path,
            anthropic_api_key,
            log_json,
        })
    }
}

/// Error types for bot configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode JSON from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config path: {0}")]
    InvalidPath(String),

    #[error("missing '{0}' field")]
    MissingField(&'static str),

    #[error("'{0}' must be greater than zero")]
    NotPositive(&'static str),

    #[error("duplicate bot id '{0}'")]
    DuplicateId(String),

    #[error("duplicate telegram_token")]
    DuplicateToken,

    #[error("config validation failed for {path}: {source}")]
    InFile {
        path: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },
}

fn default_max_tokens() -> usize {
    1000
}

/// Settings of one bot personality
#[derive(Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: String,
    pub telegram_token: String,
    #[serde(default)]
    pub memory_size: usize,
    #[serde(default)]
    pub messages_per_hour: u32,
    #[serde(default)]
    pub messages_per_day: u32,
    /// Go-style duration ("1h", "30m"); invalid values mean 24h
    #[serde(default)]
    pub temp_ban_duration: String,
    #[serde(default)]
    pub model: String,
    /// Prompt fragments: default, custom_instructions, avoid_sensitive,
    /// new_chat, continue_conversation, respond_with_emojis
    #[serde(default)]
    pub system_prompts: HashMap<String, String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub owner_telegram_id: i64,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

// Tokens stay out of logs
impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("id", &self.id)
            .field("memory_size", &self.memory_size)
            .field("messages_per_hour", &self.messages_per_hour)
            .field("messages_per_day", &self.messages_per_day)
            .field("temp_ban_duration", &self.temp_ban_duration)
            .field("model", &self.model)
            .field("active", &self.active)
            .field("owner_telegram_id", &self.owner_telegram_id)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl BotConfig {
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(
            self.messages_per_hour,
            self.messages_per_day,
            &self.temp_ban_duration,
        )
    }

    /// Check required fields and uniqueness against already accepted bots
    pub fn validate(
        &self,
        ids: &mut HashSet<String>,
        tokens: &mut HashSet<String>,
    ) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::MissingField("id"));
        }
        if !ids.insert(self.id.clone()) {
            return Err(ConfigError::DuplicateId(self.id.clone()));
        }

        if self.telegram_token.is_empty() {
            return Err(ConfigError::MissingField("telegram_token"));
        }
        if !tokens.insert(self.telegram_token.clone()) {
            return Err(ConfigError::DuplicateToken);
        }

        if self.model.is_empty() {
            return Err(ConfigError::MissingField("model"));
        }
        if self.memory_size == 0 {
            return Err(ConfigError::NotPositive("memory_size"));
        }
        if self.messages_per_hour == 0 {
            return Err(ConfigError::NotPositive("messages_per_hour"));
        }
        if self.messages_per_day == 0 {
            return Err(ConfigError::NotPositive("messages_per_day"));
        }

        Ok(())
    }

    /// Decode one config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Ensure `filename` resolves to a `.json` file inside `config_dir`
pub fn validate_config_path(config_dir: &Path, filename: &Path) -> Result<PathBuf, ConfigError> {
    let base = std::path::absolute(config_dir)
        .map(|p| normalize(&p))
        .map_err(|e| ConfigError::InvalidPath(format!("{}: {}", config_dir.display(), e)))?;

    let full = normalize(&base.join(filename));

    if !full.starts_with(&base) || full == base {
        return Err(ConfigError::InvalidPath(format!(
            "{} must be within the config directory",
            filename.display()
        )));
    }

    if full.extension().and_then(|e| e.to_str()) != Some("json") {
        return Err(ConfigError::InvalidPath(format!(
            "{} must have a .json extension",
            filename.display()
        )));
    }

    Ok(full)
}

/// Load every active bot config in `dir`, sorted by file name
pub fn load_all_configs(dir: &Path) -> Result<Vec<BotConfig>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();

    let mut ids = HashSet::new();
    let mut tokens = HashSet::new();
    let mut configs = Vec::new();

    for file in files {
        let name = file
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::InvalidPath(file.display().to_string()))?;
        let path = validate_config_path(dir, &name)?;
        let config = BotConfig::load(&path)?;

        if !config.active {
            info!(bot = %config.id, "Skipping inactive bot");
            continue;
        }

        config
            .validate(&mut ids, &mut tokens)
            .map_err(|e| ConfigError::InFile {
                path: path.clone(),
                source: Box::new(e),
            })?;

        configs.push(config);
    }

    Ok(configs)
}
