//! Configuration loading, validation, and management for taskforge.
//!
//! Loads configuration from `~/.taskforge/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Database URL that selects the in-memory store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// The root configuration structure.
///
/// Maps directly to `~/.taskforge/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Credential sealing
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// HTTP transport
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Worker pool and prompt rendering
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Script sandbox limits
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    /// Host tool settings
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite://path` or `:memory:`
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    format!(
        "sqlite://{}",
        AppConfig::config_dir().join("taskforge.db").display()
    )
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url == IN_MEMORY_DATABASE
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Passphrase the credential key is derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("passphrase", &redact(&self.passphrase))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Number of workers pulling from the queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long shutdown waits for in-flight reconciliations
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Backoff for retryable errors that carry no hint
    #[serde(default = "default_retry_secs")]
    pub default_retry_secs: u64,

    /// Directory listing depth in the system prompt
    #[serde(default = "default_listing_depth")]
    pub listing_depth: usize,

    /// Maximum entries in that listing
    #[serde(default = "default_listing_limit")]
    pub listing_limit: usize,

    /// Per-subscriber event buffer
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}
fn default_shutdown_timeout() -> u64 {
    30
}
fn default_retry_secs() -> u64 {
    5
}
fn default_listing_depth() -> usize {
    2
}
fn default_listing_limit() -> usize {
    200
}
fn default_subscriber_capacity() -> usize {
    64
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            default_retry_secs: default_retry_secs(),
            listing_depth: default_listing_depth(),
            listing_limit: default_listing_limit(),
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Engine operations before a script is aborted
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,

    /// Bytes
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,

    /// Applies to arrays and maps
    #[serde(default = "default_max_collection_size")]
    pub max_collection_size: usize,

    /// Hard wall-clock limit per script
    #[serde(default = "default_interpreter_timeout")]
    pub timeout_secs: u64,

    /// How long a cancelled script may take to unwind
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_max_operations() -> u64 {
    5_000_000
}
fn default_max_call_depth() -> usize {
    64
}
fn default_max_string_size() -> usize {
    1024 * 1024
}
fn default_max_collection_size() -> usize {
    100_000
}
fn default_interpreter_timeout() -> u64 {
    300
}
fn default_cancel_grace_ms() -> u64 {
    500
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_call_depth: default_max_call_depth(),
            max_string_size: default_max_string_size(),
            max_collection_size: default_max_collection_size(),
            timeout_secs: default_interpreter_timeout(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Programs the shell tool may start
    #[serde(default = "default_shell_allowlist")]
    pub shell_allowlist: Vec<String>,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Tool output is truncated past this many bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_shell_allowlist() -> Vec<String> {
    ["git", "npm", "cargo", "ls", "cat", "grep", "find", "wc", "head", "tail"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_allowlist: default_shell_allowlist(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.taskforge/config.toml).
    ///
    /// Environment variables override the file:
    /// - `TASKFORGE_DATABASE_URL`
    /// - `TASKFORGE_SECRET_KEY`
    /// - `TASKFORGE_CONCURRENCY`
    /// - `TASKFORGE_GATEWAY_PORT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("TASKFORGE_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(key) = lookup("TASKFORGE_SECRET_KEY") {
            self.secrets.passphrase = Some(key);
        }
        if let Some(raw) = lookup("TASKFORGE_CONCURRENCY") {
            self.reconciler.concurrency = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("TASKFORGE_CONCURRENCY is not a number: {raw}"))
            })?;
        }
        if let Some(raw) = lookup("TASKFORGE_GATEWAY_PORT") {
            self.gateway.port = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("TASKFORGE_GATEWAY_PORT is not a port: {raw}"))
            })?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".taskforge")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciler.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "reconciler.concurrency must be at least 1".into(),
            ));
        }

        if self.interpreter.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "interpreter.timeout_secs must be > 0".into(),
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database.url must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
