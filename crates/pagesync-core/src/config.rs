//! Configuration management for pagesync.
//!
//! Settings are stored as TOML. Every section has defaults, so a missing file
//! or a file that only overrides a handful of keys is fine.
//!
//! ## Configuration Hierarchy
//!
//! 1. **Defaults**: compiled in (see the `Default` impls below)
//! 2. **Config file**: `<config_dir>/config.toml`
//! 3. **Environment variables**: `PAGESYNC_CONFIG_DIR` relocates the config
//!    file, `PAGESYNC_DATA_DIR` overrides `paths.data_dir`
//!
//! ## Example Configuration File
//!
//! ```toml
//! [http]
//! timeout_secs = 15
//! page_cap = 100
//!
//! [retry]
//! max_retries = 5
//! base_delay_ms = 500
//!
//! [sync]
//! max_concurrency = 8
//! abort_threshold = 2
//!
//! [cache]
//! ttl_secs = 600
//! change_marker_field = "updated_at"
//! ```
//!
//! ```rust
//! use pagesync_core::Config;
//!
//! let config: Config = toml::from_str("[sync]\nmax_concurrency = 8\n")?;
//! assert_eq!(config.sync.max_concurrency, 8);
//! assert_eq!(config.retry.max_retries, 3);
//! # Ok::<(), toml::de::Error>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP client settings.
    pub http: HttpConfig,
    /// Request/response wire format.
    pub wire: WireFormat,
    /// Retry and backoff settings.
    pub retry: RetryConfig,
    /// Defaults for sync operations.
    pub sync: SyncConfig,
    /// Change-aware cache settings.
    pub cache: CacheConfig,
    /// Filesystem locations.
    pub paths: PathsConfig,
}

/// HTTP client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Largest page size the source will honor.
    ///
    /// Query specs asking for more are rejected at build time so that a short
    /// page always means "end of data".
    pub page_cap: usize,
    /// User-Agent header value.
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            page_cap: 100,
            user_agent: concat!("pagesync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    /// Per-request timeout as a `Duration`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Names of query parameters and response keys.
///
/// Defaults follow OData conventions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireFormat {
    /// Offset parameter.
    pub offset_param: String,
    /// Page size parameter.
    pub limit_param: String,
    /// Filter expression parameter.
    pub filter_param: String,
    /// Field selection parameter.
    pub select_param: String,
    /// Relationship expansion parameter.
    pub expand_param: String,
    /// Ordering clause parameter.
    pub order_param: String,
    /// Inline count parameter (sent as `<param>=true`).
    pub count_param: String,
    /// Response key holding the record array.
    pub records_key: String,
    /// Response keys that may hold the total count, tried in order.
    pub count_keys: Vec<String>,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            offset_param: "$skip".into(),
            limit_param: "$top".into(),
            filter_param: "$filter".into(),
            select_param: "$select".into(),
            expand_param: "$expand".into(),
            order_param: "$orderby".into(),
            count_param: "$count".into(),
            records_key: "value".into(),
            count_keys: vec!["@odata.count".into(), "count".into()],
        }
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Randomize delays into `[delay/2, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// Defaults for sync operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Worker pool size.
    pub max_concurrency: usize,
    /// Permanent page failures tolerated before the operation aborts.
    pub abort_threshold: usize,
    /// Persist the checkpoint every N committed pages.
    pub checkpoint_every: usize,
    /// Page size used when a query does not set one.
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            abort_threshold: 3,
            checkpoint_every: 1,
            page_size: 100,
        }
    }
}

/// Change-aware cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live used when the change probe is unavailable.
    pub ttl_secs: u64,
    /// Field holding the source's change marker.
    pub change_marker_field: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            change_marker_field: "modifiedAt".into(),
        }
    }
}

impl CacheConfig {
    /// TTL as a `Duration`.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for `checkpoints/` and `cache/`.
    ///
    /// Default locations:
    /// - Linux: `~/.local/share/pagesync`
    /// - macOS: `~/Library/Application Support/dev.pagesync.pagesync`
    /// - Windows: `%APPDATA%\pagesync\pagesync\data`
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: directories::ProjectDirs::from("dev", "pagesync", "pagesync").map_or_else(
                || {
                    directories::BaseDirs::new().map_or_else(
                        || PathBuf::from(".pagesync"),
                        |base| base.home_dir().join(".pagesync"),
                    )
                },
                |dirs| dirs.data_dir().to_path_buf(),
            ),
        }
    }
}

impl PathsConfig {
    /// Directory holding checkpoint files.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Directory holding cache files.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    /// when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined, or the
    /// file exists but cannot be read, parsed or validated.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    /// Load configuration from an explicit file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot
    /// be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save the configuration to an explicit file, creating parent
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {e}")))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;
        fs::write(path, content).map_err(|e| Error::Config(format!("Failed to write config: {e}")))
    }

    /// Path of the global configuration file.
    ///
    /// `PAGESYNC_CONFIG_DIR` takes precedence over the platform config
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no config directory can be determined.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("PAGESYNC_CONFIG_DIR") {
            let trimmed = dir.trim();
            if !trimmed.is_empty() {
                return Ok(PathBuf::from(trimmed).join("config.toml"));
            }
        }
        let dirs = directories::ProjectDirs::from("dev", "pagesync", "pagesync")
            .ok_or_else(|| Error::Config("Failed to determine project directories".into()))?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Reject values the client cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.http.page_cap == 0 {
            return Err(Error::Config("http.page_cap must be at least 1".into()));
        }
        if self.sync.max_concurrency == 0 {
            return Err(Error::Config("sync.max_concurrency must be at least 1".into()));
        }
        if self.sync.page_size == 0 || self.sync.page_size > self.http.page_cap {
            return Err(Error::Config(format!(
                "sync.page_size must be within 1..={}",
                self.http.page_cap
            )));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1.0".into()));
        }
        if self.cache.change_marker_field.trim().is_empty() {
            return Err(Error::Config("cache.change_marker_field must not be empty".into()));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("PAGESYNC_DATA_DIR") {
            let trimmed = dir.trim();
            if !trimmed.is_empty() {
                tracing::debug!("data dir overridden by PAGESYNC_DATA_DIR: {trimmed}");
                self.paths.data_dir = PathBuf::from(trimmed);
            }
        }
    }
}
