//! Coordination configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::CoordinationError;

/// What an instance does when the lease store errors during election
///
/// This only applies to store failures. A lease held by another owner
/// always makes the instance a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stay follower; no instance polls until the store recovers
    #[default]
    FailClosed,
    /// Assume leadership locally; duplicate polling is possible if another
    /// instance also fails open
    FailOpen,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailClosed => "fail_closed",
            Self::FailOpen => "fail_open",
        }
    }

    /// Parse from a configuration string
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "fail_closed" | "closed" => Some(Self::FailClosed),
            "fail_open" | "open" => Some(Self::FailOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease and election settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Owner id written into lease rows (unique per process)
    pub instance_id: String,

    /// Lease time-to-live in seconds
    pub lease_ttl_secs: u64,

    /// Fixed renewal interval; when unset each renewal waits a random
    /// interval between ttl/2.5 and ttl/2
    pub renewal_interval_secs: Option<u64>,

    /// How often followers retry election
    pub election_retry_secs: u64,

    /// Delay before electing when the store health probe fails
    pub health_probe_delay_secs: u64,

    /// Behaviour on store errors during election
    pub failure_policy: FailurePolicy,

    /// Lease guarding the polling loop
    pub poll_lease_name: String,

    /// Lease guarding account monitoring
    pub monitor_lease_name: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            lease_ttl_secs: 30,
            renewal_interval_secs: None,
            election_retry_secs: 15,
            health_probe_delay_secs: 5,
            failure_policy: FailurePolicy::FailClosed,
            poll_lease_name: "cadence:poll-lease".to_string(),
            monitor_lease_name: "cadence:monitor-lease".to_string(),
        }
    }
}

impl CoordinationConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn renewal_interval(&self) -> Option<Duration> {
        self.renewal_interval_secs.map(Duration::from_secs)
    }

    pub fn election_retry(&self) -> Duration {
        Duration::from_secs(self.election_retry_secs)
    }

    pub fn health_probe_delay(&self) -> Duration {
        Duration::from_secs(self.health_probe_delay_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.instance_id.trim().is_empty() {
            return Err(CoordinationError::InvalidConfig(
                "instance_id must not be empty".to_string(),
            ));
        }

        if self.lease_ttl_secs == 0 {
            return Err(CoordinationError::InvalidConfig(
                "lease_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(interval) = self.renewal_interval_secs {
            if interval == 0 || interval >= self.lease_ttl_secs {
                return Err(CoordinationError::InvalidConfig(format!(
                    "renewal_interval_secs ({interval}) must be between 1 and lease_ttl_secs ({})",
                    self.lease_ttl_secs
                )));
            }
        }

        if self.election_retry_secs == 0 {
            return Err(CoordinationError::InvalidConfig(
                "election_retry_secs must be greater than 0".to_string(),
            ));
        }

        if self.poll_lease_name == self.monitor_lease_name {
            return Err(CoordinationError::InvalidConfig(
                "poll and monitor leases must have different names".to_string(),
            ));
        }

        Ok(())
    }
}
