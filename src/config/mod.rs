//! Configuration Module
//!
//! Handles application configuration loading, validation, and management.

use crate::channels::whatsapp::{ControllerSettings, ReconnectPolicy, SessionOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// WhatsApp session configuration
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: "0.0.0.0")
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Listen port (default: 10000)
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for log files (debug mode)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            json: false,
        }
    }
}

/// WhatsApp session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Directory holding the paired session (credentials, keys)
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,

    /// Browser triple shown under "Linked devices" on the phone
    #[serde(default = "default_browser")]
    pub browser: [String; 3],

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Capacity of the connection event queue
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Reconnect automatically after the connection drops (default: false)
    #[serde(default)]
    pub auto_reconnect: bool,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_session_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("whatsgate")
        .join("session")
}

fn default_browser() -> [String; 3] {
    [
        "WhatsApp API".to_string(),
        "Chrome".to_string(),
        "1.0.0".to_string(),
    ]
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_keep_alive() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    64
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
            browser: default_browser(),
            connect_timeout_secs: default_connect_timeout(),
            keep_alive_secs: default_keep_alive(),
            event_queue_capacity: default_queue_capacity(),
            auto_reconnect: false,
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl WhatsAppConfig {
    /// Controller settings derived from this section.
    pub fn controller_settings(&self) -> ControllerSettings {
        let reconnect = if self.auto_reconnect {
            ReconnectPolicy::AfterDelay(Duration::from_secs(self.reconnect_delay_secs))
        } else {
            ReconnectPolicy::Manual
        };
        ControllerSettings {
            session: SessionOptions {
                session_dir: self.session_dir.clone(),
                browser: self.browser.clone(),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                keep_alive_interval: Duration::from_secs(self.keep_alive_secs),
                event_buffer: self.event_queue_capacity,
            },
            queue_capacity: self.event_queue_capacity,
            reconnect,
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Priority (lowest to highest):
    /// 1. Default values
    /// 2. System config: ~/.config/whatsgate/config.toml
    /// 3. Local config: ./whatsgate.toml
    /// 4. Environment variables
    pub fn load() -> Result<Self> {
        tracing::debug!("Loading configuration...");

        let mut config = Self::default();

        if let Some(system_config_path) = Self::system_config_path()
            && system_config_path.exists()
        {
            tracing::debug!("Loading system config from: {:?}", system_config_path);
            config = Self::merge_from_file(config, &system_config_path)?;
        }

        let local_config_path = Self::local_config_path();
        if local_config_path.exists() {
            tracing::debug!("Loading local config from: {:?}", local_config_path);
            config = Self::merge_from_file(config, &local_config_path)?;
        }

        config = Self::apply_env_overrides(config)?;

        tracing::debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load configuration from a specific file path
    ///
    /// Priority (lowest to highest):
    /// 1. Default values
    /// 2. Custom config file (specified path)
    /// 3. Environment variables
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Loading configuration from custom path: {:?}", path);

        if !path.exists() {
            anyhow::bail!("Config file not found: {:?}", path);
        }
        let config = Self::merge_from_file(Self::default(), path)?;
        Self::apply_env_overrides(config)
    }

    /// Get the system config path: ~/.config/whatsgate/config.toml
    pub fn system_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("whatsgate").join("config.toml"))
    }

    /// Get the local config path: ./whatsgate.toml
    fn local_config_path() -> PathBuf {
        PathBuf::from("./whatsgate.toml")
    }

    /// Load and merge configuration from a TOML file
    ///
    /// Keys present in the file replace the matching keys of `base`; everything
    /// else keeps the value `base` already had.
    fn merge_from_file(base: Self, path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::merge_toml(base, &contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    fn merge_toml(base: Self, contents: &str) -> Result<Self> {
        let overlay: toml::Table = toml::from_str(contents)?;
        let toml::Value::Table(mut merged) = toml::Value::try_from(&base)? else {
            anyhow::bail!("Configuration did not serialize to a table");
        };
        merge_tables(&mut merged, overlay);
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(config: Self) -> Result<Self> {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut config: Self, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // PORT is what hosting platforms set; WHATSGATE_PORT wins when both exist
        for key in ["PORT", "WHATSGATE_PORT"] {
            if let Some(port) = var(key) {
                config.server.port = port
                    .parse()
                    .with_context(|| format!("Invalid {}: {}", key, port))?;
            }
        }

        if let Some(bind) = var("WHATSGATE_BIND") {
            config.server.bind = bind;
        }

        if let Some(level) = var("WHATSGATE_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Some(file) = var("WHATSGATE_LOG_FILE") {
            config.logging.file = Some(PathBuf::from(file));
        }

        if let Some(dir) = var("WHATSGATE_SESSION_DIR") {
            config.whatsapp.session_dir = PathBuf::from(dir);
        }

        if let Some(auto) = var("WHATSGATE_AUTO_RECONNECT") {
            config.whatsapp.auto_reconnect = auto
                .parse()
                .with_context(|| format!("Invalid WHATSGATE_AUTO_RECONNECT: {}", auto))?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        tracing::debug!("Validating configuration...");

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port must be non-zero");
        }

        if self.whatsapp.browser.iter().any(|part| part.trim().is_empty()) {
            anyhow::bail!("whatsapp.browser entries must not be empty");
        }

        if self.whatsapp.event_queue_capacity == 0 {
            anyhow::bail!("whatsapp.event_queue_capacity must be at least 1");
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_string =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Configuration saved to: {:?}", path);
        Ok(())
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
