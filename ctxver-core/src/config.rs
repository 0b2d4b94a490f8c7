//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/ctxver/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/ctxver/` (~/.config/ctxver/)
//! - Data: `$XDG_DATA_HOME/ctxver/` (~/.local/share/ctxver/)
//! - State/Logs: `$XDG_STATE_HOME/ctxver/` (~/.local/state/ctxver/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log files are named `<prefix>.<date>.<suffix>`.
pub const LOG_FILE_PREFIX: &str = "ctxver";
pub const LOG_FILE_SUFFIX: &str = "log";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Diff computation and warm-up
    #[serde(default)]
    pub diff: DiffConfig,

    /// Session history
    #[serde(default)]
    pub history: HistoryConfig,

    /// Fragment derivation pool
    #[serde(default)]
    pub fragments: FragmentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Diff computation settings
#[derive(Debug, Deserialize, Clone)]
pub struct DiffConfig {
    /// Upper bound on extracting one fragment's text while diffing
    #[serde(default = "default_text_timeout")]
    pub text_timeout_ms: u64,

    /// How many recent contexts a warm-up pass covers
    #[serde(default = "default_warm_up_recent")]
    pub warm_up_recent: usize,

    /// Cap on the warm-up worker pool
    #[serde(default = "default_max_warm_up_workers")]
    pub max_warm_up_workers: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            text_timeout_ms: default_text_timeout(),
            warm_up_recent: default_warm_up_recent(),
            max_warm_up_workers: default_max_warm_up_workers(),
        }
    }
}

impl DiffConfig {
    pub fn text_timeout(&self) -> Duration {
        Duration::from_millis(self.text_timeout_ms)
    }

    /// Warm-up pool size: `max(1, min(max_warm_up_workers, cpus / 2))`
    pub fn warm_up_workers(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.max_warm_up_workers.min(cpus / 2).max(1)
    }
}

fn default_text_timeout() -> u64 {
    2000
}

fn default_warm_up_recent() -> usize {
    10
}

fn default_max_warm_up_workers() -> usize {
    3
}

/// Session history settings
#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Maximum number of contexts retained
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Bound on freezing fragments when a context is pushed
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            snapshot_timeout_ms: default_snapshot_timeout(),
        }
    }
}

impl HistoryConfig {
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

fn default_max_depth() -> usize {
    100
}

fn default_snapshot_timeout() -> u64 {
    5000
}

/// Fragment derivation settings
#[derive(Debug, Deserialize, Clone)]
pub struct FragmentConfig {
    /// Size of the dedicated fragment-derivation pool
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Extraction bound for usage and call-graph fragments
    #[serde(default = "default_slow_analysis_timeout")]
    pub slow_analysis_timeout_ms: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            slow_analysis_timeout_ms: default_slow_analysis_timeout(),
        }
    }
}

impl FragmentConfig {
    pub fn slow_analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_analysis_timeout_ms)
    }
}

fn default_worker_threads() -> usize {
    8
}

fn default_slow_analysis_timeout() -> u64 {
    60_000
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.diff.text_timeout_ms == 0 {
            return Err(Error::Config(
                "diff.text_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.diff.max_warm_up_workers == 0 {
            return Err(Error::Config(
                "diff.max_warm_up_workers must be at least 1".to_string(),
            ));
        }
        if self.history.max_depth == 0 {
            return Err(Error::Config(
                "history.max_depth must be at least 1".to_string(),
            ));
        }
        if self.history.snapshot_timeout_ms == 0 {
            return Err(Error::Config(
                "history.snapshot_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.fragments.worker_threads == 0 {
            return Err(Error::Config(
                "fragments.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.fragments.slow_analysis_timeout_ms == 0 {
            return Err(Error::Config(
                "fragments.slow_analysis_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/ctxver/config.toml` (~/.config/ctxver/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("ctxver").join("config.toml")
    }

    /// Returns the data directory path
    ///
    /// `$XDG_DATA_HOME/ctxver/` (~/.local/share/ctxver/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("ctxver")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/ctxver/` (~/.local/state/ctxver/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("ctxver")
    }

    /// Returns the default directory for saved sessions
    ///
    /// `$XDG_DATA_HOME/ctxver/sessions/`
    pub fn sessions_dir() -> PathBuf {
        Self::data_dir().join("sessions")
    }

    /// Returns today's log file path
    ///
    /// `$XDG_STATE_HOME/ctxver/ctxver.YYYY-MM-DD.log`. Daily rotation names
    /// files by UTC date.
    pub fn log_path() -> PathBuf {
        Self::log_path_for(chrono::Utc::now().date_naive())
    }

    /// Returns the log file written on `date` (UTC)
    pub fn log_path_for(date: chrono::NaiveDate) -> PathBuf {
        Self::state_dir().join(format!(
            "{}.{}.{}",
            LOG_FILE_PREFIX,
            date.format("%Y-%m-%d"),
            LOG_FILE_SUFFIX
        ))
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
