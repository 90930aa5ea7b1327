//! Service configuration, loaded from a TOML file.

use serde::{Deserialize, Serialize};
use crate::agcommon::{AppError, Result};

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub feeds: FeedsConfig,
    pub scheduler: SchedulerConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite file shared with the ledger node.
    pub path: String,
    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:8080".
    pub listen_addr: String,
}

/// Upstream feed endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedsConfig {
    /// JSON endpoint returning a {"<ASSET>_USD": rate} mapping.
    pub rates_url: String,
    /// Batch asset metadata resolver endpoint.
    pub metadata_url: String,
    /// Exchange rate refresh cadence in seconds.
    #[serde(default = "default_rates_refresh_secs")]
    pub rates_refresh_secs: u64,
}

/// Task cadences. The daily interval is deliberately offset from a whole
/// multiple of the hourly one so the two passes do not hit the database at
/// the same instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_hourly_interval_secs")]
    pub hourly_interval_secs: u64,
    #[serde(default = "default_daily_interval_secs")]
    pub daily_interval_secs: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_pool_size() -> u32 {
    8
}

fn default_rates_refresh_secs() -> u64 {
    60
}

fn default_hourly_interval_secs() -> u64 {
    60
}

fn default_daily_interval_secs() -> u64 {
    // 10.5 minutes, offset from the hourly cadence
    630
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::ConfigError(format!("failed to read {}: {}", path, e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("failed to parse {}: {}", path, e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(AppError::ConfigError("database.path must not be empty".to_string()));
        }
        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("database.pool_size must be greater than 0".to_string()));
        }
        if self.scheduler.hourly_interval_secs == 0
            || self.scheduler.daily_interval_secs == 0
            || self.scheduler.snapshot_interval_secs == 0
        {
            return Err(AppError::ConfigError("scheduler intervals must be greater than 0".to_string()));
        }
        if self.feeds.rates_refresh_secs == 0 {
            return Err(AppError::ConfigError("feeds.rates_refresh_secs must be greater than 0".to_string()));
        }
        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| AppError::ConfigError(format!("invalid server.listen_addr: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [database]
        path = "./data/agent_stats.db"

        [server]
        listen_addr = "127.0.0.1:8080"

        [feeds]
        rates_url = "http://localhost:9001/rates"
        metadata_url = "http://localhost:9002/metadata"

        [scheduler]
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.database.pool_size, 8);
        assert_eq!(config.scheduler.hourly_interval_secs, 60);
        assert_eq!(config.scheduler.daily_interval_secs, 630);
        assert_eq!(config.feeds.rates_refresh_secs, 60);
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.server.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_cadence() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.scheduler.hourly_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
