//! Configuration management for Teamcast
//!
//! Configuration is read from a TOML file. Every tuning knob has a default, so
//! a file with only `[database]` and one platform section is enough to run.
//!
//! ```toml
//! [database]
//! path = "~/.local/share/teamcast/teamcast.db"
//!
//! [vault]
//! keys_file = "~/.config/teamcast/vault-keys.toml"
//!
//! [publishing]
//! max_retries = 3
//! retry_base_delay_secs = 5
//!
//! [twitter]
//! client_id = "..."
//! client_secret = "..."
//! redirect_uri = "https://app.example.com/oauth/twitter"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    pub twitter: Option<TwitterConfig>,
    pub facebook: Option<FacebookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/teamcast/teamcast.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// TOML file holding the versioned age identities
    pub keys_file: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            keys_file: "~/.config/teamcast/vault-keys.toml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishingConfig {
    /// Retries per platform after a transient failure
    pub max_retries: u32,
    /// The n-th retry waits n times this long
    pub retry_base_delay_secs: u64,
    /// Upper bound on any single adapter call
    pub adapter_timeout_secs: u64,
    /// Refresh is skipped while the token is valid for longer than this
    pub refresh_threshold_hours: i64,
    /// Publishing refreshes first when the token expires within this window
    pub publish_refresh_skew_secs: i64,
    /// 429 responses per account per hour before it is marked rate limited
    pub rate_limit_threshold: u32,
    pub analytics_cache_ttl_secs: u64,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_secs: 5,
            adapter_timeout_secs: 30,
            refresh_threshold_hours: 24,
            publish_refresh_skew_secs: 300,
            rate_limit_threshold: 5,
            analytics_cache_ttl_secs: 15 * 60,
        }
    }
}

impl PublishingConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn refresh_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.refresh_threshold_hours)
    }

    pub fn publish_refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.publish_refresh_skew_secs)
    }

    pub fn analytics_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.analytics_cache_ttl_secs)
    }

    /// Longest stretch of a publish between two lease renewals: an adapter
    /// call, a forced token refresh and the longest retry delay
    pub fn max_renewal_gap(&self) -> Duration {
        self.adapter_timeout() * 2 + self.retry_base_delay() * self.max_retries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub poll_interval_secs: u64,
    /// How long a claimed job stays locked to its worker
    pub lease_secs: i64,
    pub max_attempts: u32,
    /// The n-th failed attempt is retried after n times this long
    pub retry_delay_secs: u64,
    pub retry_jitter_secs: u64,
    /// Jobs claimed per poll
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            lease_secs: 300,
            max_attempts: 3,
            retry_delay_secs: 60,
            retry_jitter_secs: 10,
            batch_size: 10,
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub batch_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_secs: 30,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitterConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default = "default_twitter_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_twitter_api_base")]
    pub api_base: String,
    #[serde(default = "default_twitter_auth_base")]
    pub auth_base: String,
    #[serde(default = "default_twitter_upload_base")]
    pub upload_base: String,
}

fn default_twitter_scopes() -> Vec<String> {
    ["tweet.read", "tweet.write", "users.read", "offline.access"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_twitter_api_base() -> String {
    "https://api.twitter.com".to_string()
}

fn default_twitter_auth_base() -> String {
    "https://twitter.com".to_string()
}

fn default_twitter_upload_base() -> String {
    "https://upload.twitter.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacebookConfig {
    pub app_id: String,
    pub app_secret: String,
    pub redirect_uri: String,
    /// Page to publish to; the first manageable page when unset
    pub page_id: Option<String>,
    #[serde(default = "default_facebook_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_graph_version")]
    pub graph_version: String,
    #[serde(default = "default_graph_base")]
    pub graph_base: String,
    #[serde(default = "default_dialog_base")]
    pub dialog_base: String,
}

fn default_facebook_scopes() -> Vec<String> {
    [
        "pages_show_list",
        "pages_read_engagement",
        "pages_manage_posts",
        "read_insights",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_graph_version() -> String {
    "v19.0".to_string()
}

fn default_graph_base() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_dialog_base() -> String {
    "https://www.facebook.com".to_string()
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue.lease_secs <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.lease_secs".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        let gap = self.publishing.max_renewal_gap();
        if (self.queue.lease_secs as u64) <= gap.as_secs() {
            return Err(ConfigError::InvalidValue {
                field: "queue.lease_secs".to_string(),
                reason: format!(
                    "must exceed {}s, the longest a publish runs between lease renewals",
                    gap.as_secs()
                ),
            }
            .into());
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TEAMCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("teamcast").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("teamcast"))
}
