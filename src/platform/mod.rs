//! Social platform API client
//!
//! The polling loop and the publish worker only see the
//! [`SocialPlatformClient`] trait. [`HttpPlatformClient`] is the production
//! implementation over the platform's REST API.

pub mod error;
pub mod http;

pub use error::PlatformError;
pub use http::HttpPlatformClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{AccountStats, Credential, MediaType};

/// Platform client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// API base URL
    pub base_url: String,

    /// Local throttle on outbound requests, independent of the quota limiter
    pub requests_per_second: u32,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            requests_per_second: 5,
            request_timeout_secs: 30,
        }
    }
}

impl PlatformConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        url::Url::parse(&self.base_url)
            .map_err(|e| format!("platform.base_url is invalid: {e}"))?;
        if self.request_timeout_secs == 0 {
            return Err("platform.request_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Content to publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub media_refs: Vec<String>,
    pub caption: String,
    pub media_type: MediaType,
}

/// Successful publish result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub external_id: String,
}

/// Operations the coordinator needs from the social platform
#[async_trait]
pub trait SocialPlatformClient: Send + Sync {
    /// Fetch the minimal stats used for change detection
    async fn fetch_account_stats(&self, credential: &Credential)
        -> Result<AccountStats, PlatformError>;

    /// Publish content and return the platform's post id
    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest,
    ) -> Result<PublishReceipt, PlatformError>;
}
