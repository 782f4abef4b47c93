//! Engine configuration.
//!
//! Resolution order: TOML file (if given) → `PLOGGY_*` environment
//! overrides → built-in defaults. A changed configuration is applied by
//! handing it to [`crate::engine::Engine::reload`], which restarts the engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::FULL_PRECISION;
use crate::protocol::DEFAULT_PULL_PERIOD;

/// Background workers when nothing else is configured.
pub const DEFAULT_WORKER_COUNT: usize = 30;

/// Port the local web server listens on behind the hidden service.
pub const DEFAULT_LISTEN_PORT: u16 = 0;

const DATA_DIRECTORY: &str = "ploggyData";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("{0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the record files
    pub data_dir: PathBuf,

    /// Local port handed to the transport; 0 lets the server pick
    pub listen_port: u16,

    /// Fixed period between pulls of the same friend
    #[serde(rename = "pull_period_ms", with = "duration_ms")]
    pub pull_period: Duration,

    /// Size of the background worker pool
    pub worker_count: usize,

    /// Decimal places of location kept in self status
    pub location_precision: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen_port: DEFAULT_LISTEN_PORT,
            pull_period: DEFAULT_PULL_PERIOD,
            worker_count: DEFAULT_WORKER_COUNT,
            location_precision: FULL_PRECISION,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ploggy")
        .join(DATA_DIRECTORY)
}

impl EngineConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// TOML file plus environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value })
        }

        if let Some(dir) = lookup("PLOGGY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("PLOGGY_LISTEN_PORT") {
            self.listen_port = parse("PLOGGY_LISTEN_PORT", v)?;
        }
        if let Some(v) = lookup("PLOGGY_PULL_PERIOD_MS") {
            self.pull_period = Duration::from_millis(parse("PLOGGY_PULL_PERIOD_MS", v)?);
        }
        if let Some(v) = lookup("PLOGGY_WORKERS") {
            self.worker_count = parse("PLOGGY_WORKERS", v)?;
        }
        if let Some(v) = lookup("PLOGGY_LOCATION_PRECISION") {
            self.location_precision = parse("PLOGGY_LOCATION_PRECISION", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pull_period.is_zero() {
            return Err(ConfigError::Invalid("pull period must be positive"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker count must be positive"));
        }
        if !(0..=FULL_PRECISION).contains(&self.location_precision) {
            return Err(ConfigError::Invalid("location precision out of range"));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
