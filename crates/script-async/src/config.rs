//! Manager Configuration
//!
//! Read from the `[async_commands]` table of a TOML file. Every key is
//! optional.
//!
//! ```toml
//! [async_commands]
//! async_command_loop_ms = 100
//! lock_timeout_ms = 5000
//! autostart_scheduler = true
//! transport_poll = "all_engines"
//! dataserver_timeout_ms = 30000
//! max_listens_per_script = 65
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Which engines the HTTP and XML-RPC checks run for in each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPollMode {
    /// Poll every registered engine
    #[default]
    AllEngines,
    /// Poll only the first registered engine. HTTP responses and XML-RPC
    /// traffic for scripts in other engines stay queued in their scene
    /// modules and are never delivered.
    FirstEngine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Sleep between scheduler passes
    #[serde(default = "default_loop_ms")]
    pub async_command_loop_ms: u64,

    /// Registry lock acquisition timeout; absent means wait forever
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,

    /// Start the scheduler thread on the first engine registration
    #[serde(default = "default_autostart")]
    pub autostart_scheduler: bool,

    #[serde(default)]
    pub transport_poll: TransportPollMode,

    /// Unanswered dataserver requests older than this are dropped
    #[serde(default = "default_dataserver_timeout_ms")]
    pub dataserver_timeout_ms: u64,

    #[serde(default = "default_max_listens")]
    pub max_listens_per_script: usize,
}

fn default_loop_ms() -> u64 {
    100
}

fn default_autostart() -> bool {
    true
}

fn default_dataserver_timeout_ms() -> u64 {
    30_000
}

fn default_max_listens() -> usize {
    65
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            async_command_loop_ms: default_loop_ms(),
            lock_timeout_ms: None,
            autostart_scheduler: default_autostart(),
            transport_poll: TransportPollMode::default(),
            dataserver_timeout_ms: default_dataserver_timeout_ms(),
            max_listens_per_script: default_max_listens(),
        }
    }
}

/// Top-level config file; other sections belong to other subsystems.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    async_commands: ManagerConfig,
}

impl ManagerConfig {
    /// Parse the `[async_commands]` table out of a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        file.async_commands.validate()
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), ?config, "Loaded async command config");
        Ok(config)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.async_command_loop_ms == 0 {
            return Err(ConfigError::Invalid(
                "async_command_loop_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_listens_per_script == 0 {
            return Err(ConfigError::Invalid(
                "max_listens_per_script must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }

    /// Sleep between scheduler passes
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.async_command_loop_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn dataserver_timeout(&self) -> Duration {
        Duration::from_millis(self.dataserver_timeout_ms)
    }

    /// Set the cycle interval
    pub fn with_loop_ms(mut self, ms: u64) -> Self {
        self.async_command_loop_ms = ms;
        self
    }

    /// Set whether the scheduler starts on first registration
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart_scheduler = autostart;
        self
    }

    pub fn with_transport_poll(mut self, mode: TransportPollMode) -> Self {
        self.transport_poll = mode;
        self
    }

    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = Some(ms);
        self
    }
}
