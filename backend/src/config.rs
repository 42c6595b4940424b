//! Configuration management for the allocation engine
//!
//! Supports hierarchical configuration loading:
//! 1. Default values in code
//! 2. Configuration files (config/development.toml, config/production.toml)
//! 3. Environment variable overrides with ALLOC_ prefix

use chrono::{FixedOffset, Offset, Utc};
use config::{ConfigError, Environment, File};
use serde::Deserialize;
use shared::AllocationPolicy;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Current environment (development, production)
    pub environment: String,

    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Allocation engine tuning
    pub allocation: AllocationSettings,

    /// Log output
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server port
    pub port: u16,

    /// Server host
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    pub acquire_timeout_secs: u64,

    /// Per-statement timeout; a timed-out transaction rolls back untouched
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AllocationSettings {
    /// Policy used for order intake and inbound stock
    pub default_policy: AllocationPolicy,

    /// Retries for a single grant that lost a race
    pub max_retries: u32,

    /// Linear backoff between retries
    pub retry_backoff_ms: u64,

    /// Business time zone used for day-scoped reconciliation (KST = +9)
    pub utc_offset_hours: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format
    pub json: bool,
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("ALLOC_ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let config = config::Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.statement_timeout_ms", 15_000)?
            .set_default("allocation.default_policy", "fifo")?
            .set_default("allocation.max_retries", 3)?
            .set_default("allocation.retry_backoff_ms", 50)?
            .set_default("allocation.utc_offset_hours", 9)?
            .set_default("logging.json", false)?
            // Load environment-specific config file
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Override with environment variables (ALLOC_ prefix)
            .add_source(
                Environment::with_prefix("ALLOC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.allocation.validate()?;
        Ok(config)
    }
}

impl AllocationSettings {
    /// Business time zone as a chrono offset
    pub fn business_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(ConfigError::Message(format!(
                "allocation.utc_offset_hours out of range: {}",
                self.utc_offset_hours
            )));
        }
        Ok(())
    }
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            default_policy: AllocationPolicy::Fifo,
            max_retries: 3,
            retry_backoff_ms: 50,
            utc_offset_hours: 9,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}
