//! Publishing, fallback and Redis settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker and retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Attempts before content is marked `failed`
    pub max_attempts: u32,

    /// Jobs processed concurrently per instance
    pub worker_concurrency: usize,

    /// First redelivery delay after a failed attempt
    pub retry_base_delay_secs: u64,

    /// Cap on the redelivery delay
    pub retry_max_delay_secs: u64,

    /// A reserved job not acknowledged within this is redelivered
    pub visibility_timeout_secs: u64,

    /// An `active` claim older than this may be taken over
    pub stale_claim_secs: u64,

    /// Sleep between reservations when the queue is empty
    pub idle_poll_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            worker_concurrency: 3,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 900,
            visibility_timeout_secs: 300,
            stale_claim_secs: 600,
            idle_poll_secs: 1,
        }
    }
}

impl PublishConfig {
    /// Exponential backoff for the n-th delivery (1-based), capped
    pub fn retry_delay(&self, delivery: u32) -> Duration {
        let exponent = delivery.saturating_sub(1).min(20) as i32;
        let secs = self.retry_base_delay_secs as f64 * 2f64.powi(exponent);
        Duration::from_secs((secs as u64).min(self.retry_max_delay_secs))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn stale_claim(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_claim_secs as i64)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs.max(1))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("publish.max_attempts must be greater than 0".to_string());
        }
        if self.worker_concurrency == 0 {
            return Err("publish.worker_concurrency must be greater than 0".to_string());
        }
        if self.retry_base_delay_secs > self.retry_max_delay_secs {
            return Err(
                "publish.retry_base_delay_secs must not exceed retry_max_delay_secs".to_string(),
            );
        }
        if self.visibility_timeout_secs == 0 {
            return Err("publish.visibility_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Fallback sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Seconds between sweeps
    pub tick_secs: u64,

    /// Sweep even while the queue is reachable
    pub always_sweep: bool,

    /// Due items loaded per sweep
    pub batch_size: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            always_sweep: true,
            batch_size: 100,
        }
    }
}

impl FallbackConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tick_secs == 0 {
            return Err("fallback.tick_secs must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("fallback.batch_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Redis connection settings for the durable queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL; empty disables the durable queue
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Key prefix for namespacing
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "cadence".to_string(),
        }
    }
}

impl RedisConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_growth() {
        let config = PublishConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(30));
        assert_eq!(config.retry_delay(2), Duration::from_secs(60));
        assert_eq!(config.retry_delay(3), Duration::from_secs(120));
        assert_eq!(config.retry_delay(10), Duration::from_secs(900));
        assert_eq!(config.retry_delay(u32::MAX), Duration::from_secs(900));
    }

    #[test]
    fn test_validate() {
        assert!(PublishConfig::default().validate().is_ok());
        assert!(FallbackConfig::default().validate().is_ok());

        let config = PublishConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PublishConfig {
            retry_base_delay_secs: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_disabled_by_empty_url() {
        let config = RedisConfig {
            url: "  ".to_string(),
            ..Default::default()
        };
        assert!(!config.is_enabled());
        assert!(RedisConfig::default().is_enabled());
    }
}
