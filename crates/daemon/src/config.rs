//! Configuration management for the TermHub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("terminal size must be non-zero, got {rows}x{cols}")]
    InvalidTerminalSize { rows: u16, cols: u16 },

    #[error("output_buffer_cap must be greater than 0, got {0}")]
    InvalidOutputBufferCap(usize),

    #[error("media_buffer_cap must be greater than 0, got {0}")]
    InvalidMediaBufferCap(usize),

    #[error("read_chunk_size must be between 1 and 1048576, got {0}")]
    InvalidReadChunkSize(usize),

    #[error("poll_interval_ms must be between 1 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("subscriber_capacity must be greater than 0, got {0}")]
    InvalidSubscriberCapacity(usize),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("automation suffixes must be non-empty strings")]
    InvalidAutomationSuffix,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TermHub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Automation-file delegation.
    pub automation: AutomationConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Override for the IPC socket path.
    pub socket_path: Option<PathBuf>,
}

/// Which process backend new sessions use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// PTY on unix, pipes elsewhere.
    #[default]
    Auto,
    /// Always use a pseudo-terminal.
    Pty,
    /// Always use plain pipes.
    Pipe,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to use for new sessions. Empty means detect from the environment.
    pub default_shell: String,

    /// Process backend selection.
    pub backend: BackendPreference,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Initial terminal rows for PTY sessions.
    pub rows: u16,

    /// Initial terminal columns for PTY sessions.
    pub cols: u16,

    /// Number of output chunks retained per session.
    pub output_buffer_cap: usize,

    /// Number of media events retained per session.
    pub media_buffer_cap: usize,

    /// Maximum bytes taken from the backend in one read.
    pub read_chunk_size: usize,

    /// Readiness wait of the reader loop, in milliseconds.
    pub poll_interval_ms: u64,

    /// Bounded wait for process exit once the reader loop stops, in milliseconds.
    pub exit_grace_ms: u64,

    /// Channel slots per subscriber before it is considered unresponsive.
    pub subscriber_capacity: usize,

    /// Extra environment variables applied after the built-in overrides.
    pub env: BTreeMap<String, String>,
}

/// Automation-file delegation settings.
///
/// A command ending in one of `suffixes` is handed to `runner` when that
/// program can be found; otherwise the file's contents are displayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutomationConfig {
    /// Recognized automation-file suffixes.
    pub suffixes: Vec<String>,

    /// Entry point program; looked up on PATH unless absolute.
    pub runner: Option<String>,

    /// Arguments placed before the file path.
    pub runner_args: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            socket_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: String::new(),
            backend: BackendPreference::Auto,
            max_sessions: 64,
            rows: 24,
            cols: 80,
            output_buffer_cap: 10_000,
            media_buffer_cap: 1_000,
            read_chunk_size: 4096,
            poll_interval_ms: 50,
            exit_grace_ms: 5_000,
            subscriber_capacity: 256,
            env: BTreeMap::new(),
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            suffixes: vec![".workflow.yaml".to_string(), ".workflow.yml".to_string()],
            runner: None,
            runner_args: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Readiness wait of the reader loop.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bounded wait for process exit after the reader loop breaks.
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMHUB_SHELL: Override the default shell
    /// - TERMHUB_SOCKET: Override the IPC socket path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("TERMHUB_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = shell;
            }
        }

        if let Ok(socket) = std::env::var("TERMHUB_SOCKET") {
            if !socket.is_empty() {
                tracing::info!("Overriding socket_path from environment: {}", socket);
                self.daemon.socket_path = Some(PathBuf::from(socket));
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.rows == 0 || session.cols == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                rows: session.rows,
                cols: session.cols,
            });
        }

        if session.output_buffer_cap == 0 {
            return Err(ConfigError::InvalidOutputBufferCap(session.output_buffer_cap));
        }

        if session.media_buffer_cap == 0 {
            return Err(ConfigError::InvalidMediaBufferCap(session.media_buffer_cap));
        }

        if session.read_chunk_size == 0 || session.read_chunk_size > 1024 * 1024 {
            return Err(ConfigError::InvalidReadChunkSize(session.read_chunk_size));
        }

        if session.poll_interval_ms == 0 || session.poll_interval_ms > 1000 {
            return Err(ConfigError::InvalidPollInterval(session.poll_interval_ms));
        }

        if session.subscriber_capacity == 0 {
            return Err(ConfigError::InvalidSubscriberCapacity(
                session.subscriber_capacity,
            ));
        }

        // An empty shell means "detect at spawn time".
        if !session.default_shell.is_empty() {
            let shell_path = Path::new(&session.default_shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(&session.default_shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
            }
        }

        if self.automation.suffixes.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::InvalidAutomationSuffix);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
