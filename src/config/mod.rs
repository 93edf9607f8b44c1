//! Store configuration
//!
//! Layered loading: defaults, then an optional TOML file, then `REVKV_*`
//! environment variables. The result is validated before use.

pub mod error;

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

pub use error::ConfigError;

use crate::constants::DEFAULT_BUSY_BACKOFF;
use crate::constants::DEFAULT_BUSY_TIMEOUT;
use crate::constants::DEFAULT_COMPACTION_INTERVAL;
use crate::constants::DEFAULT_MAX_BUSY_RETRIES;
use crate::constants::MIN_COMPACTION_INTERVAL;

/// Where a mutation checks its expected revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyCheck {
    /// Read and compare inside the transaction that writes the new version.
    #[default]
    Strict,
    /// Read and compare in a separate transaction before writing. A writer
    /// committing between the two is not detected.
    BestEffort,
}

impl fmt::Display for ConcurrencyCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyCheck::Strict => write!(f, "strict"),
            ConcurrencyCheck::BestEffort => write!(f, "best_effort"),
        }
    }
}

impl FromStr for ConcurrencyCheck {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(ConcurrencyCheck::Strict),
            "best_effort" | "best-effort" | "besteffort" => Ok(ConcurrencyCheck::BestEffort),
            other => Err(ConfigError::invalid(
                "concurrency_check",
                other,
                "expected 'strict' or 'best_effort'",
            )),
        }
    }
}

/// Background compaction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Milliseconds between compaction runs.
    pub interval_ms: u64,
    /// Also physically delete rows whose TTL has passed.
    pub expire_ttl: bool,
}

impl CompactionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_COMPACTION_INTERVAL.as_millis() as u64,
            expire_ttl: false,
        }
    }
}

/// Top-level store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// How long SQLite waits on a lock before reporting busy.
    pub busy_timeout_ms: u64,
    /// Transaction retries after a busy error.
    pub max_busy_retries: u32,
    /// Base backoff between busy retries.
    pub busy_backoff_ms: u64,
    pub concurrency_check: ConcurrencyCheck,
    pub compaction: CompactionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
            max_busy_retries: DEFAULT_MAX_BUSY_RETRIES,
            busy_backoff_ms: DEFAULT_BUSY_BACKOFF.as_millis() as u64,
            concurrency_check: ConcurrencyCheck::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Default configuration pointing at `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Load configuration with layered approach:
    /// 1. Start with defaults
    /// 2. Load from TOML file if one is given
    /// 3. Override with environment variables
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `REVKV_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("REVKV_DATA_PATH") {
            self.path = val.into();
        }
        if let Some(val) = lookup("REVKV_BUSY_TIMEOUT_MS") {
            self.busy_timeout_ms = parse_env("REVKV_BUSY_TIMEOUT_MS", &val)?;
        }
        if let Some(val) = lookup("REVKV_MAX_BUSY_RETRIES") {
            self.max_busy_retries = parse_env("REVKV_MAX_BUSY_RETRIES", &val)?;
        }
        if let Some(val) = lookup("REVKV_BUSY_BACKOFF_MS") {
            self.busy_backoff_ms = parse_env("REVKV_BUSY_BACKOFF_MS", &val)?;
        }
        if let Some(val) = lookup("REVKV_CONCURRENCY_CHECK") {
            self.concurrency_check = val.parse()?;
        }
        if let Some(val) = lookup("REVKV_COMPACTION_INTERVAL_MS") {
            self.compaction.interval_ms = parse_env("REVKV_COMPACTION_INTERVAL_MS", &val)?;
        }
        if let Some(val) = lookup("REVKV_EXPIRE_TTL") {
            self.compaction.expire_ttl = parse_env("REVKV_EXPIRE_TTL", &val)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("path", "", "database path cannot be empty"));
        }
        if self.compaction.interval() < MIN_COMPACTION_INTERVAL {
            return Err(ConfigError::invalid(
                "compaction.interval_ms",
                self.compaction.interval_ms,
                format!("must be at least {}ms", MIN_COMPACTION_INTERVAL.as_millis()),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }

    fn default_path() -> PathBuf {
        "./data/revkv.db".into()
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, value, e.to_string()))
}
