//! Configuration management for Genesis
//!
//! Loads and saves runtime parameters from `~/.genesis/config.json`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod paths;

pub use paths::{config_path, data_dir, decode_filename, safe_filename};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config not found: {0}")]
    NotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Text completion backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

/// Agent loop bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Maximum Reasoning/Acting round trips per invocation
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Consecutive unparsable responses tolerated before aborting
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: u32,
    /// Consecutive infrastructure failures (action or provider) before aborting
    #[serde(default = "default_max_consecutive_infra_errors")]
    pub max_consecutive_infra_errors: u32,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    /// Wall-clock bound for a whole invocation
    #[serde(default = "default_max_wall_clock_secs")]
    pub max_wall_clock_secs: u64,
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_parse_retries: default_max_parse_retries(),
            max_consecutive_infra_errors: default_max_consecutive_infra_errors(),
            provider_timeout_secs: default_provider_timeout_secs(),
            action_timeout_secs: default_action_timeout_secs(),
            max_wall_clock_secs: default_max_wall_clock_secs(),
            max_history_messages: default_max_history_messages(),
        }
    }
}

fn default_max_steps() -> u32 {
    5
}

fn default_max_parse_retries() -> u32 {
    2
}

fn default_max_consecutive_infra_errors() -> u32 {
    2
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_action_timeout_secs() -> u64 {
    30
}

fn default_max_wall_clock_secs() -> u64 {
    600
}

fn default_max_history_messages() -> usize {
    20
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

/// Action executor limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,
    /// Cap on captured stdout/stderr per stream
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_actions: default_max_concurrent_actions(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_max_concurrent_actions() -> usize {
    4
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

/// Plugin directory overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homes_dir: Option<String>,
}

/// Assistant persona injected into the system prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,
    #[serde(default)]
    pub personality: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            personality: String::new(),
        }
    }
}

fn default_bot_name() -> String {
    "Genesis AI".to_string()
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub persona: PersonaConfig,
}

impl Config {
    /// Load from the default location
    pub async fn load() -> Result<Self> {
        let path = config_path();
        Self::load_from(&path).await
    }

    /// Load from specific location
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("no config found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        debug!("reading config from {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save to the default location
    pub async fn save(&self) -> Result<()> {
        let path = config_path();
        self.save_to(&path).await
    }

    /// Save to specific location
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        debug!("writing config to {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// System plugin directory, honoring the override
    pub fn system_plugins_dir(&self) -> PathBuf {
        self.plugins
            .system_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(paths::system_plugins_dir)
    }

    /// Root holding every user's data
    pub fn users_dir(&self) -> PathBuf {
        self.plugins
            .users_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(paths::users_dir)
    }

    /// Plugin directory for one user
    pub fn user_plugins_dir(&self, user: &str) -> PathBuf {
        paths::user_plugins_dir(&self.users_dir(), user)
    }

    /// Root of action working homes
    pub fn homes_dir(&self) -> PathBuf {
        self.plugins
            .homes_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(paths::homes_dir)
    }

    /// Access key for the completion backend
    pub fn api_key(&self) -> Option<String> {
        let key = self.provider.api_key.trim();
        if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key().is_some()
    }

    pub fn default_model(&self) -> String {
        self.provider.model.clone()
    }

    pub fn max_steps(&self) -> u32 {
        self.agent.defaults.max_steps
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.defaults.provider_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.defaults.action_timeout_secs)
    }

    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_secs(self.agent.defaults.max_wall_clock_secs)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Write the default config and create the directory skeleton
pub async fn init() -> Result<Config> {
    let config_path = config_path();

    if config_path.exists() {
        warn!("config already exists at {:?}", config_path);
    } else {
        let config = Config::default();
        config.save().await?;
        info!("config written to {:?}", config_path);
    }

    let config = Config::load().await?;
    for dir in [
        config.system_plugins_dir(),
        config.users_dir(),
        config.homes_dir(),
        paths::sessions_dir(),
    ] {
        paths::ensure_dir(&dir).await?;
    }
    info!("data directory ready at {:?}", data_dir());

    Ok(config)
}
