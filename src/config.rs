//! Bridge Configuration
//!
//! Handles parsing and management of scriptlink.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::conn::StreamConfig;

/// Name of the configuration file searched for by [`BridgeConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "scriptlink.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching scriptlink.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BridgeConfig {
    /// Request transport settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Stream connection settings
    #[serde(default)]
    pub stream: StreamSettings,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    ///
    /// Falls back to defaults when no file exists up to the root.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Request transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Overall request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// User-Agent sent when the script does not set one
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Largest response body accepted; 0 disables the cap
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_user_agent() -> String {
    format!("scriptlink/{}", crate::VERSION)
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

// Socket timeouts reject a zero duration, so both are clamped to 1ms.
impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Stream connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamSettings {
    /// Upper bound of one background receive attempt, in milliseconds
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Receive queue cap per connection (0 = unbounded)
    #[serde(default)]
    pub max_queued_frames: usize,
}

fn default_receive_timeout_ms() -> u64 {
    5_000
}

impl StreamSettings {
    /// Loop tuning derived from these settings
    pub fn to_stream_config(&self) -> StreamConfig {
        StreamConfig {
            // A zero timeout would turn the reader into a busy loop.
            receive_timeout: Duration::from_millis(self.receive_timeout_ms.max(1)),
            max_queued_frames: self.max_queued_frames,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            receive_timeout_ms: default_receive_timeout_ms(),
            max_queued_frames: 0,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Colored output
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_log_filter() -> String {
    "warn".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            ansi: default_ansi(),
        }
    }
}
