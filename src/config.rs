//! TOML configuration.
//!
//! Read from `comic-minder/config.toml` in the OS config directory, or
//! from the file given with `--config`. Every section and key is
//! optional; missing ones take their defaults.
//!
//! Libraries themselves live in the database; this file only holds the
//! tuning knobs of the sync engine and where things are stored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database location
    pub database: DatabaseConfig,

    /// Sync engine settings
    pub sync: SyncConfig,

    /// Cover cache settings
    pub covers: CoverConfig,
}

/// Database settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file (None = `comic_minder.db` in the data directory)
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    /// Resolve the database file path.
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("comic-minder"))
                .unwrap_or_else(|| PathBuf::from("."))
                .join(crate::db::DEFAULT_DB_NAME)
        })
    }
}

/// Sync engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Floor for any library's poll interval
    pub poll_min_interval_secs: u64,

    /// Poll interval for newly added libraries
    pub default_poll_every_secs: u64,

    /// Quiet period before a library's batch is flushed
    pub batch_quiet_ms: u64,

    /// Flush immediately once this many operations are batched
    pub batch_max_ops: usize,

    /// Flush even under continuous churn after this long
    pub batch_max_wait_secs: u64,

    /// Maximum filter predicates per query
    pub max_filter_predicates: usize,

    /// Wait for in-flight copies to settle before importing
    pub wait_for_copies: bool,

    /// How often to re-measure sizes while waiting for copies
    pub copy_wait_poll_ms: u64,

    /// Give up waiting for copies after this long
    pub copy_wait_expiry_secs: u64,

    /// Back-off applied to libraries that look unmounted
    pub unreachable_backoff_secs: u64,

    /// How long each worker gets to drain on shutdown
    pub shutdown_timeout_secs: u64,

    /// OS event debounce window
    pub debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_min_interval_secs: 60,
            default_poll_every_secs: 3600,
            batch_quiet_ms: 1500,
            batch_max_ops: 10_000,
            batch_max_wait_secs: 60,
            max_filter_predicates: 990,
            wait_for_copies: true,
            copy_wait_poll_ms: 1000,
            copy_wait_expiry_secs: 600,
            unreachable_backoff_secs: 3600,
            shutdown_timeout_secs: 10,
            debounce_ms: 500,
        }
    }
}

impl SyncConfig {
    pub fn batch_quiet(&self) -> Duration {
        Duration::from_millis(self.batch_quiet_ms)
    }

    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_secs(self.batch_max_wait_secs)
    }

    pub fn poll_min_interval(&self) -> Duration {
        Duration::from_secs(self.poll_min_interval_secs)
    }

    pub fn unreachable_backoff(&self) -> Duration {
        Duration::from_secs(self.unreachable_backoff_secs)
    }

    pub fn copy_wait_poll(&self) -> Duration {
        Duration::from_millis(self.copy_wait_poll_ms)
    }

    pub fn copy_wait_expiry(&self) -> Duration {
        Duration::from_secs(self.copy_wait_expiry_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Predicate cap, never zero.
    pub fn predicate_cap(&self) -> usize {
        self.max_filter_predicates.max(1)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_max_ops == 0 {
            return Err("sync.batch_max_ops must be at least 1".into());
        }
        if self.batch_max_wait_secs == 0 {
            return Err("sync.batch_max_wait_secs must be at least 1".into());
        }
        if self.poll_min_interval_secs == 0 {
            return Err("sync.poll_min_interval_secs must be at least 1".into());
        }
        Ok(())
    }
}

/// Cover cache settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverConfig {
    /// Cache directory (None = OS cache dir)
    pub cache_dir: Option<PathBuf>,
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Default config file: `comic-minder/config.toml` in the OS config dir.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("comic-minder").join("config.toml"))
}

/// Load the default config file.
///
/// Never fails: a missing or broken file yields the defaults.
pub fn load() -> Config {
    match config_path() {
        Some(path) => load_from(&path),
        None => {
            tracing::warn!(target: "config", "No config directory on this platform, using defaults");
            Config::default()
        }
    }
}

/// Load a specific config file, falling back to defaults.
pub fn load_from(path: &Path) -> Config {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(target: "config", path = %path.display(), "No config file, using defaults");
            return Config::default();
        }
        Err(e) => {
            tracing::error!(target: "config", path = %path.display(), error = %e, "Cannot read config, using defaults");
            return Config::default();
        }
    };
    match toml::from_str(&contents) {
        Ok(config) => {
            tracing::info!(target: "config", path = %path.display(), "Config loaded");
            config
        }
        Err(e) => {
            tracing::error!(target: "config", path = %path.display(), error = %e, "Invalid config, using defaults");
            Config::default()
        }
    }
}

/// Write `config` to `path`, replacing it atomically.
pub fn save_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::io(dir, e))?;
    }
    let contents = toml::to_string_pretty(config)?;

    let staged = path.with_extension("toml.tmp");
    std::fs::write(&staged, contents).map_err(|e| ConfigError::io(&staged, e))?;
    std::fs::rename(&staged, path).map_err(|e| ConfigError::io(path, e))?;

    tracing::info!(target: "config", path = %path.display(), "Config saved");
    Ok(())
}

/// Config file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No config directory on this platform")]
    NoConfigDir,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
