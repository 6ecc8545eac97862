//! Engine configuration.
//!
//! Every field has a default, so an empty TOML file (or none at all) yields a
//! working engine. Session times are Eastern Time wall-clock values.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Schema/source version stamped into the cache root. Bump when the record
/// layout or the upstream provider changes; every cached series is discarded.
pub const CACHE_SCHEMA_VERSION: u32 = 2;

/// Upper bound on provider retries per request.
pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First date requested for a full-history backfill.
    pub backfill_epoch: NaiveDate,
    /// Directory holding one Parquet record per instrument plus the version marker.
    pub cache_root: PathBuf,
    /// Live polling period.
    pub poll_interval_secs: u64,
    /// Maximum instruments per provider batch call.
    pub chunk_size: usize,
    /// Worker threads used for parallel chunk fetches.
    pub max_parallel_chunks: usize,
    #[serde(with = "time_serde")]
    pub extended_open: NaiveTime,
    #[serde(with = "time_serde")]
    pub extended_close: NaiveTime,
    #[serde(with = "time_serde")]
    pub market_close: NaiveTime,
    /// Per-request timeout; a timeout is reported as a network error.
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    /// Trailing window (calendar days) used to find today's bar or a quote.
    pub today_window_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backfill_epoch: NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch"),
            cache_root: PathBuf::from("data/market_cache"),
            poll_interval_secs: 60,
            chunk_size: 200,
            max_parallel_chunks: 5,
            extended_open: NaiveTime::from_hms_opt(4, 0, 0).expect("valid time"),
            extended_close: NaiveTime::from_hms_opt(20, 0, 0).expect("valid time"),
            market_close: NaiveTime::from_hms_opt(16, 0, 0).expect("valid time"),
            request_timeout_secs: 30,
            max_retries: 3,
            today_window_days: 5,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Same defaults, different cache root.
    pub fn with_cache_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be > 0".into()));
        }
        if self.max_parallel_chunks == 0 {
            return Err(ConfigError::Invalid("max_parallel_chunks must be > 0".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be > 0".into()));
        }
        if self.extended_open >= self.extended_close {
            return Err(ConfigError::Invalid(format!(
                "extended_open {} must precede extended_close {}",
                self.extended_open, self.extended_close
            )));
        }
        if self.market_close < self.extended_open || self.market_close > self.extended_close {
            return Err(ConfigError::Invalid(format!(
                "market_close {} must fall inside the extended window",
                self.market_close
            )));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!("max_retries must be <= {MAX_RETRIES}")));
        }
        if self.today_window_days < 1 {
            return Err(ConfigError::Invalid("today_window_days must be >= 1".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `HH:MM` or `HH:MM:SS` session times.
mod time_serde {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
            .map_err(serde::de::Error::custom)
    }
}
