//! marshal.toml configuration parser.
//!
//! Every section and field is optional. Accessors resolve the
//! effective value, falling back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Interval between two host drain cycles unless `drain.draining_period_secs` says otherwise.
pub const DEFAULT_DRAINING_PERIOD: Duration = Duration::from_secs(5);

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_HEALTH_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_INSTANCE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_INSTANCE_ATTEMPTS: u32 = 3;
const DEFAULT_STORE_FILE: &str = "marshal.redb";
const DEFAULT_LOG_FILTER: &str = "info,marshal=debug,marshald=debug";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarshalConfig {
    pub store: Option<StoreSettings>,
    pub update: Option<UpdateSettings>,
    pub drain: Option<DrainSettings>,
    pub log: Option<LogSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// How often the engine looks for updates without a driver.
    pub poll_interval_ms: Option<u64>,
    /// How often a wave re-evaluates pod health while waiting.
    pub health_poll_interval_ms: Option<u64>,
    /// Upper bound on one launch attempt before it counts as failed.
    pub instance_timeout_secs: Option<u64>,
    /// Attempts used when an update asks for `max_instance_attempts = 0`.
    pub default_max_instance_attempts: Option<u32>,
    pub concurrent_update_policy: Option<ConcurrentUpdatePolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrainSettings {
    pub draining_period_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    pub filter: Option<String>,
    pub json: Option<bool>,
}

/// What happens when an update is created while another one on the
/// same job is still active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrentUpdatePolicy {
    /// Abort the active update and run the new one.
    #[default]
    Supersede,
    /// Hold the new update in INITIALIZED until older updates finish.
    Queue,
    /// Refuse the new update.
    Reject,
}

impl MarshalConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MarshalConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(drain) = &self.drain {
            if drain.draining_period_secs == Some(0) {
                return Err(ConfigError::Invalid(
                    "drain.draining_period_secs must be positive".to_string(),
                ));
            }
        }
        if let Some(update) = &self.update {
            if update.poll_interval_ms == Some(0) || update.health_poll_interval_ms == Some(0) {
                return Err(ConfigError::Invalid(
                    "update poll intervals must be positive".to_string(),
                ));
            }
            if update.default_max_instance_attempts == Some(0) {
                return Err(ConfigError::Invalid(
                    "update.default_max_instance_attempts must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Store path; relative to `data_dir` when the config does not name one.
    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        self.store
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_else(|| data_dir.join(DEFAULT_STORE_FILE))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.update
                .as_ref()
                .and_then(|u| u.poll_interval_ms)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        )
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.update
                .as_ref()
                .and_then(|u| u.health_poll_interval_ms)
                .unwrap_or(DEFAULT_HEALTH_POLL_INTERVAL_MS),
        )
    }

    pub fn instance_timeout(&self) -> Duration {
        Duration::from_secs(
            self.update
                .as_ref()
                .and_then(|u| u.instance_timeout_secs)
                .unwrap_or(DEFAULT_INSTANCE_TIMEOUT_SECS),
        )
    }

    pub fn default_max_instance_attempts(&self) -> u32 {
        self.update
            .as_ref()
            .and_then(|u| u.default_max_instance_attempts)
            .unwrap_or(DEFAULT_MAX_INSTANCE_ATTEMPTS)
    }

    pub fn concurrent_update_policy(&self) -> ConcurrentUpdatePolicy {
        self.update
            .as_ref()
            .and_then(|u| u.concurrent_update_policy)
            .unwrap_or_default()
    }

    pub fn draining_period(&self) -> Duration {
        self.drain
            .as_ref()
            .and_then(|d| d.draining_period_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DRAINING_PERIOD)
    }

    pub fn log_filter(&self) -> String {
        self.log
            .as_ref()
            .and_then(|l| l.filter.clone())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
    }

    pub fn log_json(&self) -> bool {
        self.log.as_ref().and_then(|l| l.json).unwrap_or(false)
    }
}
