//! Configuration management for crosspost
//!
//! All binaries read the same TOML file. Every section is optional and falls
//! back to [`Config::default_config`], so an empty file is a working setup
//! (minus delivery targets).
//!
//! ```toml
//! [database]
//! path = "~/.local/share/crosspost/crosspost.db"
//!
//! [storage]
//! root = "~/.local/share/crosspost/objects"
//!
//! [queue]
//! max_attempts = 5
//! retry_backoff_secs = 30
//!
//! [webhooks.twitch]
//! secret_name = "twitch_webhook_secret"
//!
//! [rate_limits]
//! discord = 30
//!
//! [[platforms]]
//! id = "discord"
//! kind = "http"
//! url_secret = "discord_hook_url"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::is_path_safe_id;

pub const CONFIG_ENV: &str = "CROSSPOST_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// Posts per hour, keyed by target platform id
    #[serde(default)]
    pub rate_limits: HashMap<String, u32>,
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/crosspost/crosspost.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the object store (staged content and sessions)
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "~/.local/share/crosspost/objects".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a dequeued message stays invisible (and a claimed job stays leased)
    pub visibility_timeout_secs: u64,
    /// Deliveries of one message before the job is faulted
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// First retry delay; doubles per attempt
    pub retry_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// How often the worker daemon collects finished bundles and prunes the ledger
    pub sweep_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 300,
            max_attempts: 5,
            poll_interval_ms: 1000,
            batch_size: 16,
            retry_backoff_secs: 30,
            max_backoff_secs: 3600,
            sweep_interval_secs: 600,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_body_size: usize,
    pub concurrency_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            max_body_size: 1_048_576,
            concurrency_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhooksConfig {
    /// Dedup ledger retention; must outlive the provider's redelivery window
    pub retention_hours: u64,
    /// Signed messages older than this are rejected as replays
    pub max_message_age_secs: i64,
    pub twitch: TwitchConfig,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            retention_hours: 72,
            max_message_age_secs: 600,
            twitch: TwitchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchConfig {
    /// Name of the EventSub signing secret in the secret store
    pub secret_name: String,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            secret_name: "twitch_webhook_secret".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Secret `foo_bar` is read from `{env_prefix}FOO_BAR`
    pub env_prefix: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            env_prefix: "CROSSPOST_SECRET_".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// POST the job as JSON to a URL held in the secret store
    Http,
    /// Accept every delivery without side effects
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub id: String,
    pub kind: PlatformKind,
    #[serde(default)]
    pub url_secret: Option<String>,
    #[serde(default = "default_platform_timeout")]
    pub timeout_secs: u64,
}

fn default_platform_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file yields the default configuration.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if !config_path.exists() {
            tracing::debug!(
                "No config file at {}, using defaults",
                config_path.display()
            );
            return Ok(Self::default_config());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.storage.root.trim().is_empty() {
            return Err(ConfigError::MissingField("storage.root".to_string()).into());
        }
        if self.queue.max_attempts == 0 {
            return Err(invalid("queue.max_attempts", "must be at least 1"));
        }
        if self.queue.batch_size == 0 {
            return Err(invalid("queue.batch_size", "must be at least 1"));
        }
        if self.queue.visibility_timeout_secs == 0 {
            return Err(invalid("queue.visibility_timeout_secs", "must be at least 1"));
        }

        let mut seen = HashSet::new();
        for platform in &self.platforms {
            if !is_path_safe_id(&platform.id) {
                return Err(invalid(
                    "platforms.id",
                    &format!(
                        "'{}' must be non-empty and contain no '/', '..' or whitespace",
                        platform.id
                    ),
                ));
            }
            if !seen.insert(platform.id.as_str()) {
                return Err(invalid(
                    "platforms.id",
                    &format!("'{}' is configured more than once", platform.id),
                ));
            }
            if platform.timeout_secs >= self.queue.visibility_timeout_secs {
                return Err(invalid(
                    "platforms.timeout_secs",
                    &format!(
                        "'{}' timeout must be shorter than queue.visibility_timeout_secs ({})",
                        platform.id, self.queue.visibility_timeout_secs
                    ),
                ));
            }
            if platform.kind == PlatformKind::Http && platform.url_secret.is_none() {
                return Err(ConfigError::MissingField(format!(
                    "platforms[{}].url_secret",
                    platform.id
                ))
                .into());
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::CrosspostError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following the XDG Base Directory layout
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosspost").join("config.toml"))
}
