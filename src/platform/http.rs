//! HTTP client for the social platform REST API
//!
//! Calls are throttled locally with governor before they leave the process.
//! The quota-level budget is the [`RateLimiter`](crate::ratelimit::RateLimiter)'s
//! job; this throttle only keeps bursts (many accounts ticking at once) off
//! the wire.

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{header::RETRY_AFTER, Client, Response};
use serde::Deserialize;
use std::num::NonZeroU32;

use super::{PlatformConfig, PlatformError, PublishReceipt, PublishRequest, SocialPlatformClient};
use crate::metrics;
use crate::models::{AccountStats, Credential};

#[derive(Debug, Deserialize)]
struct StatsResponse {
    followers_count: u64,
    media_count: u64,
    #[serde(default)]
    engagement: f64,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Platform REST client
pub struct HttpPlatformClient {
    /// HTTP client with configured timeout and compression
    client: Client,

    /// Local burst throttle
    throttle: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    base_url: String,
}

impl HttpPlatformClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Http` if the HTTP client cannot be created
    pub fn new(config: &PlatformConfig) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .gzip(true)
            .build()?;

        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let throttle = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            throttle,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a client against a custom base URL (mock servers in tests)
    pub fn with_base_url(base_url: &str) -> Result<Self, PlatformError> {
        Self::new(&PlatformConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Turn a non-success response into a typed error
    async fn error_from_response(response: Response) -> PlatformError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);

        PlatformError::from_status(status, message, retry_after)
    }

    fn map_transport(err: reqwest::Error) -> PlatformError {
        if err.is_timeout() {
            PlatformError::Timeout
        } else {
            PlatformError::Http(err)
        }
    }
}

#[async_trait]
impl SocialPlatformClient for HttpPlatformClient {
    async fn fetch_account_stats(
        &self,
        credential: &Credential,
    ) -> Result<AccountStats, PlatformError> {
        self.throttle.until_ready().await;
        let _timer = metrics::start_api_timer("account_stats");

        let response = self
            .client
            .get(self.url(&format!("/v1/accounts/{}/stats", credential.account_id)))
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(Self::map_transport)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let stats: StatsResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;

        Ok(AccountStats {
            follower_count: stats.followers_count,
            media_count: stats.media_count,
            engagement: stats.engagement,
        })
    }

    async fn publish(
        &self,
        credential: &Credential,
        request: &PublishRequest,
    ) -> Result<PublishReceipt, PlatformError> {
        if request.media_refs.is_empty() {
            return Err(PlatformError::InvalidMedia(
                "content has no media attached".to_string(),
            ));
        }

        self.throttle.until_ready().await;
        let _timer = metrics::start_api_timer("publish");

        let body = serde_json::json!({
            "media_type": request.media_type.as_str(),
            "media_urls": request.media_refs,
            "caption": request.caption,
        });

        let response = self
            .client
            .post(self.url(&format!("/v1/accounts/{}/media", credential.account_id)))
            .bearer_auth(&credential.access_token)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_transport)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let published: PublishResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;

        Ok(PublishReceipt {
            external_id: published.id,
        })
    }
}
