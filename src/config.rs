//! Configuration loading.
//!
//! Threadline reads a single human-owned `config.toml`. Every section is
//! optional; missing values fall back to the defaults below. The database path
//! can be overridden with the `THREADLINE_DB` environment variable.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable that overrides [`DatabaseConfig::path`].
pub const DB_PATH_ENV: &str = "THREADLINE_DB";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// SQLite storage settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Input limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Retry policy for transactions that lose a lock race.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SQLite storage settings.
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `~/.threadline/threadline.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits for the database lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Input limits.
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted message body in bytes.
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content_bytes(),
        }
    }
}

/// Retry policy for transaction failures.
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for rotated JSON log files. Console-only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

// Default value functions for serde

fn default_max_connections() -> u32 {
    8
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_max_content_bytes() -> usize {
    65_536
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    50
}
fn default_log_level() -> String {
    "info".to_owned()
}

/// Load the config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load `~/.threadline/config.toml`, or defaults when the file is absent.
///
/// # Errors
///
/// Returns an error if the home directory is unknown or the file exists but
/// cannot be parsed.
pub fn load_default_config() -> anyhow::Result<Config> {
    let path = config_dir()?.join("config.toml");
    if path.exists() {
        load_config(&path)
    } else {
        Ok(Config::default())
    }
}

/// Resolve the default config directory (`~/.threadline/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".threadline"))
}

/// Resolve the database file.
///
/// Precedence: `THREADLINE_DB`, then `[database].path`, then
/// `~/.threadline/threadline.db`.
///
/// # Errors
///
/// Returns an error if the default location is needed and the home directory
/// cannot be determined.
pub fn database_path(config: &DatabaseConfig) -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os(DB_PATH_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    match &config.path {
        Some(path) => Ok(path.clone()),
        None => Ok(config_dir()?.join("threadline.db")),
    }
}
