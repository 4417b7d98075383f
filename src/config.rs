use std::path::Path;

use chrono::NaiveDate;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::market_state::MarketStateConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub daemon: DaemonConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional market definitions; when empty the built-in defaults
    /// (US_EQ / EU_EQ / ASIA_EQ) are used
    #[serde(default)]
    pub markets: Vec<MarketStateConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Market IDs to orchestrate (e.g. ["US_EQ", "EU_EQ"])
    pub markets: Vec<String>,
    /// Sleep interval between polling cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Fixed as-of date; derived from wall clock each cycle when unset
    #[serde(default)]
    pub as_of_date: Option<NaiveDate>,
    /// Bounded cycle count per market worker (demo/testing); unbounded when unset
    #[serde(default)]
    pub max_cycles: Option<u64>,
}

fn default_poll_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("daemon.poll_interval_secs", 60)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific config (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CONDUCTOR_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CONDUCTOR_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("CONDUCTOR")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a configuration for CLI usage without config files
    pub fn for_markets(markets: Vec<String>, database_url: &str) -> Self {
        Self {
            daemon: DaemonConfig {
                markets,
                poll_interval_secs: 60,
                as_of_date: None,
                max_cycles: None,
            },
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: 5,
            },
            logging: LoggingConfig::default(),
            markets: Vec::new(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.daemon.markets.is_empty() {
            errors.push("daemon.markets must not be empty".to_string());
        }

        if self.daemon.poll_interval_secs == 0 {
            errors.push("daemon.poll_interval_secs must be positive".to_string());
        }

        for market in &self.markets {
            if market.session_times.session_open_utc >= market.session_times.session_close_utc {
                errors.push(format!(
                    "market {}: session_open_utc must be before session_close_utc",
                    market.market_id
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_markets_is_valid() {
        let config = AppConfig::for_markets(
            vec!["US_EQ".to_string()],
            "postgres://localhost/conductor",
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.daemon.poll_interval_secs, 60);
    }

    #[test]
    fn test_empty_markets_rejected() {
        let config = AppConfig::for_markets(Vec::new(), "postgres://localhost/conductor");
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("markets")));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = AppConfig::for_markets(
            vec!["US_EQ".to_string()],
            "postgres://localhost/conductor",
        );
        config.daemon.poll_interval_secs = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("poll_interval")));
    }
}
