//! Configuration management for cadence
//!
//! This module handles loading and validating configuration from environment variables
//! and TOML files. Every section has defaults, so a file only needs the keys it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::coordination::{CoordinationConfig, FailurePolicy};
use crate::platform::PlatformConfig;
use crate::polling::PollingSettings;
use crate::publish::{FallbackConfig, PublishConfig, RedisConfig};
use crate::ratelimit::RateLimitConfig;
use crate::storage::DatabaseConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lease and election settings
    pub coordination: CoordinationConfig,

    /// Platform request quota
    pub rate_limit: RateLimitConfig,

    /// Adaptive polling intervals
    pub polling: PollingSettings,

    /// Publish attempts and worker settings
    pub publish: PublishConfig,

    /// Fallback sweep settings
    pub fallback: FallbackConfig,

    /// PostgreSQL configuration
    pub database: DatabaseConfig,

    /// Redis job queue configuration
    pub redis: RedisConfig,

    /// Social platform API client
    pub platform: PlatformConfig,

    /// HTTP control plane
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Control plane server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_address: String,

    /// Enable request logging
    pub enable_request_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            enable_request_logging: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Read and parse an environment variable, keeping `current` when unset
fn env_or<T: FromStr>(key: &str, current: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(current)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from a file when given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Overlay `CADENCE_*`, `DATABASE_URL` and `REDIS_URL` onto this configuration
    pub fn apply_env(&mut self) {
        // Coordination
        let c = &mut self.coordination;
        if let Some(id) = env_string("CADENCE_INSTANCE_ID") {
            c.instance_id = id;
        }
        c.lease_ttl_secs = env_or("CADENCE_LEASE_TTL_SECS", c.lease_ttl_secs);
        if let Some(secs) = env_string("CADENCE_RENEWAL_INTERVAL_SECS") {
            c.renewal_interval_secs = secs.trim().parse().ok().or(c.renewal_interval_secs);
        }
        c.election_retry_secs = env_or("CADENCE_ELECTION_RETRY_SECS", c.election_retry_secs);
        c.health_probe_delay_secs =
            env_or("CADENCE_HEALTH_PROBE_DELAY_SECS", c.health_probe_delay_secs);
        if let Some(policy) = env_string("CADENCE_FAILURE_POLICY").and_then(|v| FailurePolicy::parse(&v)) {
            c.failure_policy = policy;
        }

        // Rate limit
        let r = &mut self.rate_limit;
        r.global_cap = env_or("CADENCE_RATE_LIMIT_GLOBAL_CAP", r.global_cap);
        r.window_secs = env_or("CADENCE_RATE_LIMIT_WINDOW_SECS", r.window_secs);
        r.account_cap_divisor = env_or("CADENCE_RATE_LIMIT_ACCOUNT_DIVISOR", r.account_cap_divisor);
        r.min_gap_multiplier = env_or("CADENCE_RATE_LIMIT_MIN_GAP_MULTIPLIER", r.min_gap_multiplier);

        // Polling
        let p = &mut self.polling;
        p.default_interval_secs = env_or("CADENCE_POLL_DEFAULT_SECS", p.default_interval_secs);
        p.active_interval_secs = env_or("CADENCE_POLL_ACTIVE_SECS", p.active_interval_secs);
        p.backoff_interval_secs = env_or("CADENCE_POLL_BACKOFF_SECS", p.backoff_interval_secs);
        p.inactive_interval_secs = env_or("CADENCE_POLL_INACTIVE_SECS", p.inactive_interval_secs);
        p.night_interval_secs = env_or("CADENCE_POLL_NIGHT_SECS", p.night_interval_secs);
        p.utc_offset_minutes = env_or("CADENCE_UTC_OFFSET_MINUTES", p.utc_offset_minutes);

        // Publishing
        let q = &mut self.publish;
        q.max_attempts = env_or("CADENCE_PUBLISH_MAX_ATTEMPTS", q.max_attempts);
        q.worker_concurrency = env_or("CADENCE_WORKER_CONCURRENCY", q.worker_concurrency);
        self.fallback.tick_secs = env_or("CADENCE_FALLBACK_TICK_SECS", self.fallback.tick_secs);
        self.fallback.always_sweep = env_or("CADENCE_FALLBACK_ALWAYS_SWEEP", self.fallback.always_sweep);

        // Backends
        if let Some(url) = env_string("CADENCE_DATABASE_URL").or_else(|| env_string("DATABASE_URL")) {
            self.database.postgres_url = url;
        }
        self.database.pool_size = env_or("CADENCE_DATABASE_POOL_SIZE", self.database.pool_size);
        if let Ok(url) = std::env::var("CADENCE_REDIS_URL").or_else(|_| std::env::var("REDIS_URL")) {
            // An explicitly empty URL disables the Redis backend
            self.redis.url = url.trim().to_string();
        }
        if let Some(prefix) = env_string("CADENCE_REDIS_KEY_PREFIX") {
            self.redis.key_prefix = prefix;
        }
        if let Some(url) = env_string("CADENCE_PLATFORM_BASE_URL") {
            self.platform.base_url = url;
        }
        self.platform.requests_per_second =
            env_or("CADENCE_PLATFORM_RPS", self.platform.requests_per_second);

        // Server and logging
        if let Some(addr) = env_string("CADENCE_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Some(level) = env_string("CADENCE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_string("CADENCE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.coordination
            .validate()
            .context("Invalid [coordination] section")?;
        self.rate_limit
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [rate_limit] section")?;
        self.polling
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [polling] section")?;
        self.publish
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [publish] section")?;
        self.fallback
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [fallback] section")?;
        self.platform
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid [platform] section")?;

        if self.database.pool_size == 0 {
            anyhow::bail!("database.pool_size must be greater than 0");
        }

        if self.redis.is_enabled() && self.redis.pool_size == 0 {
            anyhow::bail!("redis.pool_size must be greater than 0");
        }

        self.server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("server.bind_address is invalid: {}", self.server.bind_address))?;

        match self.logging.format.as_str() {
            "text" | "pretty" | "json" => {}
            other => anyhow::bail!("logging.format must be text or json, got '{other}'"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [coordination]
            lease_ttl_secs = 60
            failure_policy = "fail_open"

            [rate_limit]
            global_cap = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.coordination.lease_ttl_secs, 60);
        assert_eq!(config.coordination.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.coordination.election_retry_secs, 15);
        assert_eq!(config.rate_limit.global_cap, 100);
        assert_eq!(config.rate_limit.window_secs, 3600);
        assert_eq!(config.publish.max_attempts, 3);
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = Config::default();
        config.server.bind_address = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_section_is_reported() {
        let mut config = Config::default();
        config.coordination.lease_ttl_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("coordination"));
    }
}
