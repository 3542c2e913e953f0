//! Client configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `$XDG_CONFIG_HOME/bitloops/client.toml` (or `~/.config/...`)
//! - Windows: `%APPDATA%/bitloops/client.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Authentication mode of the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthConfig {
    /// No credentials.
    Anonymous,
    /// Static API key.
    #[serde(rename = "X-API-Key")]
    ApiKey { token: String },
    /// Externally authenticated Firebase user.
    FirebaseUser {
        provider_id: String,
        access_token: String,
    },
    /// Interactive Bitloops user; the only mode that sends user headers.
    User {
        provider_id: String,
        client_id: String,
    },
}

/// Reconnect tuning as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Give up after this many failed attempts. Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    60
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: None,
        }
    }
}

/// Bitloops client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host (and optional port) of the Bitloops REST server.
    pub server: String,

    /// Workspace every topic belongs to.
    pub workspace_id: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub environment_id: String,

    #[serde(default)]
    pub messaging_sender_id: String,

    /// Use `https` unless explicitly disabled.
    #[serde(default = "default_ssl")]
    pub ssl: bool,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Send `{ "topics": [..] }` instead of `{ "topic": .. }` on subscribe.
    #[serde(default)]
    pub legacy_topic_list: bool,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

fn default_ssl() -> bool {
    true
}

impl ClientConfig {
    /// Creates a configuration with defaults for everything but the
    /// server and workspace.
    pub fn new(server: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            workspace_id: workspace_id.into(),
            api_key: String::new(),
            environment_id: String::new(),
            messaging_sender_id: String::new(),
            ssl: default_ssl(),
            auth: None,
            legacy_topic_list: false,
            reconnect: ReconnectSettings::default(),
        }
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), server = %config.server, "configuration loaded");
        Ok(config)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the fields every request depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::Invalid("server must not be empty".into()));
        }
        if self.server.contains("://") {
            return Err(ConfigError::Invalid(
                "server must be a host without scheme; use `ssl` to pick http or https".into(),
            ));
        }
        if self.workspace_id.trim().is_empty() {
            return Err(ConfigError::Invalid("workspace_id must not be empty".into()));
        }
        if self.reconnect.initial_delay_secs == 0
            || self.reconnect.initial_delay_secs > self.reconnect.max_delay_secs
        {
            return Err(ConfigError::Invalid(
                "reconnect delays must satisfy 0 < initial_delay_secs <= max_delay_secs".into(),
            ));
        }
        Ok(())
    }

    /// `http` when SSL is explicitly disabled, `https` otherwise.
    pub fn scheme(&self) -> &'static str {
        if self.ssl { "https" } else { "http" }
    }

    /// Scheme and server, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.server.trim_end_matches('/'))
    }

    /// Absolute URL for an endpoint path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    /// Returns `true` when the interactive-user auth mode is configured.
    pub fn is_user_auth(&self) -> bool {
        matches!(self.auth, Some(AuthConfig::User { .. }))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("bitloops").join("client.toml"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
