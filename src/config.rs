//! Runtime configuration loaded from `VIGIL_*` environment variables.
//!
//! Every setting has a default so that a bare `vigil` invocation starts a
//! working (if not very useful) pipeline against a local SQLite file and a
//! local Redis.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MonitorError, Result};

/// Default HTTP port for the admin surface.
const DEFAULT_PORT: u16 = 8002;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_URL: &str = "sqlite:vigil.db?mode=rwc";

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

const DEFAULT_ACCESS_LOG_PATH: &str = "/var/log/nginx/access.json.log";

const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 30;

const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Counters at or above this value are recorded as violations.
const DEFAULT_VIOLATION_THRESHOLD: i64 = 5;

const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Minimum master key length accepted by the crypto module.
pub const MIN_MASTER_KEY_LEN: usize = 32;

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub access_log_path: String,
    pub collection_interval: Duration,
    pub retention_days: u32,
    pub violation_threshold: i64,
    pub crypto_master_key: String,
    pub probe_timeout: Duration,
}

impl Config {
    /// Load configuration from the environment and validate it.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            port: parse_var("VIGIL_PORT", DEFAULT_PORT),
            database_url: env::var("VIGIL_DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DB_URL.to_string()),
            redis_url: env::var("VIGIL_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            access_log_path: env::var("VIGIL_ACCESS_LOG_PATH")
                .unwrap_or_else(|_| DEFAULT_ACCESS_LOG_PATH.to_string()),
            collection_interval: Duration::from_secs(parse_var(
                "VIGIL_COLLECTION_INTERVAL_SECS",
                DEFAULT_COLLECTION_INTERVAL_SECS,
            )),
            retention_days: parse_var("VIGIL_RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
            violation_threshold: parse_var("VIGIL_VIOLATION_THRESHOLD", DEFAULT_VIOLATION_THRESHOLD),
            crypto_master_key: env::var("VIGIL_CRYPTO_MASTER_KEY").unwrap_or_default(),
            probe_timeout: Duration::from_secs(parse_var(
                "VIGIL_PROBE_TIMEOUT_SECS",
                DEFAULT_PROBE_TIMEOUT_SECS,
            )),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.crypto_master_key.len() < MIN_MASTER_KEY_LEN {
            return Err(MonitorError::Config(format!(
                "VIGIL_CRYPTO_MASTER_KEY must be at least {} characters",
                MIN_MASTER_KEY_LEN
            )));
        }
        if self.collection_interval.is_zero() {
            return Err(MonitorError::Config(
                "collection interval must be greater than zero".to_string(),
            ));
        }
        if self.retention_days == 0 {
            return Err(MonitorError::Config(
                "retention days must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_URL.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            access_log_path: DEFAULT_ACCESS_LOG_PATH.to_string(),
            collection_interval: Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS),
            retention_days: DEFAULT_RETENTION_DAYS,
            violation_threshold: DEFAULT_VIOLATION_THRESHOLD,
            crypto_master_key: String::new(),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when it
/// is unset or unparsable.
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            crypto_master_key: "k".repeat(MIN_MASTER_KEY_LEN),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_validate_with_key() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_short_master_key_rejected() {
        let config = Config {
            crypto_master_key: "short".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(MonitorError::Config(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = Config {
            collection_interval: Duration::ZERO,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let config = Config {
            retention_days: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }
}
