//! REST API handlers for the control plane

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::server::AppState;
use crate::coordination::Role;
use crate::metrics;
use crate::models::{ContentRecord, Platform};
use crate::polling::AccountView;
use crate::publish::PublishError;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instance_id: String,
    pub uptime_secs: u64,
}

/// Instance status
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub instance_id: String,
    pub role: Role,
    /// Leader under the fail-open policy without holding the leases
    pub degraded: bool,
    pub held_leases: Vec<String>,
    pub polling: PollingStatus,
    pub queue: QueueStatus,
}

#[derive(Debug, Serialize)]
pub struct PollingStatus {
    pub running: bool,
    pub active_accounts: usize,
    pub accounts: Vec<AccountView>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub backend: &'static str,
    pub durable: bool,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
}

/// Schedule request body; the content id comes from the path
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub workspace_id: String,
    pub account_id: String,
    pub platform: Platform,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub media_refs: Vec<String>,
}

impl ScheduleRequest {
    fn into_record(self, content_id: String) -> ContentRecord {
        let mut record = ContentRecord::new(
            content_id,
            self.workspace_id,
            self.account_id,
            self.platform,
            self.scheduled_at,
        )
        .with_title(self.title)
        .with_caption(self.caption);
        record.media_refs = self.media_refs;
        record
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub content_id: String,
    pub canceled: bool,
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub account_id: String,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/metrics", get(get_metrics))
        // Publishing
        .route(
            "/api/content/{id}/schedule",
            post(schedule_content).delete(cancel_content),
        )
        // Polling
        .route("/api/accounts/{id}/activity", post(record_activity))
        .with_state(state)
}

// ============================================================================
// Health Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.elector.locks().owner_id().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    }))
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.queue.backend();
    let reachable = backend.is_reachable().await;
    let depth = if reachable { backend.len().await.ok() } else { None };

    let mut held_leases = state.elector.locks().held_leases();
    held_leases.sort();

    Json(ApiResponse::success(StatusResponse {
        instance_id: state.elector.locks().owner_id().to_string(),
        role: state.elector.role(),
        degraded: state.elector.is_degraded(),
        held_leases,
        polling: PollingStatus {
            running: state.scheduler.is_running(),
            active_accounts: state.scheduler.active_accounts(),
            accounts: state.scheduler.views(),
        },
        queue: QueueStatus {
            backend: backend.name(),
            durable: backend.is_durable(),
            reachable,
            depth,
        },
    }))
}

/// Prometheus text exposition
async fn get_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        ),
    }
}

// ============================================================================
// Publishing Handlers
// ============================================================================

async fn schedule_content(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
    Json(request): Json<ScheduleRequest>,
) -> Response {
    if content_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content id must not be empty");
    }

    let record = request.into_record(content_id);
    match state.queue.schedule(&record).await {
        Ok(handle) => (StatusCode::ACCEPTED, Json(ApiResponse::success(handle))).into_response(),
        Err(e) => publish_error_response(e),
    }
}

async fn cancel_content(State(state): State<AppState>, Path(content_id): Path<String>) -> Response {
    match state.queue.cancel(&content_id).await {
        Ok(true) => Json(ApiResponse::success(CancelResponse {
            content_id,
            canceled: true,
        }))
        .into_response(),
        Ok(false) => error_response(
            StatusCode::CONFLICT,
            format!("Content '{content_id}' is not scheduled"),
        ),
        Err(e) => publish_error_response(e),
    }
}

fn publish_error_response(err: PublishError) -> Response {
    let status = match &err {
        PublishError::NotFound(_) => StatusCode::NOT_FOUND,
        PublishError::AlreadyPublished(_) | PublishError::InProgress(_) => StatusCode::CONFLICT,
        e if e.is_recoverable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(error = %err, status = status.as_u16(), "Publish request failed");
    error_response(status, err.to_string())
}

// ============================================================================
// Polling Handlers
// ============================================================================

async fn record_activity(State(state): State<AppState>, Path(account_id): Path<String>) -> Response {
    match state.scheduler.record_user_activity(&account_id).await {
        Ok(true) => Json(ApiResponse::success(ActivityResponse {
            account_id,
            recorded_at: state.clock.now(),
        }))
        .into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            format!("Account '{account_id}' is not monitored"),
        ),
        Err(e) => {
            let status = if e.is_recoverable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            error_response(status, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::coordination::{CoordinationConfig, LeaderElector, LockCoordinator, MemoryLeaseStore};
    use crate::events::ChannelBroadcaster;
    use crate::models::{AccountStats, Credential, PollingConfig};
    use crate::platform::{PlatformError, PublishReceipt, PublishRequest, SocialPlatformClient};
    use crate::polling::{PollingScheduler, PollingSettings};
    use crate::publish::{MemoryQueueBackend, PublishQueue};
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use crate::storage::{ContentStore, MemoryContentStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct NoopClient;

    #[async_trait]
    impl SocialPlatformClient for NoopClient {
        async fn fetch_account_stats(&self, _: &Credential) -> Result<AccountStats, PlatformError> {
            Ok(AccountStats::default())
        }

        async fn publish(&self, _: &Credential, _: &PublishRequest) -> Result<PublishReceipt, PlatformError> {
            Err(PlatformError::Timeout)
        }
    }

    fn test_state() -> (AppState, Arc<MemoryContentStore>) {
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryContentStore::new());
        let locks = Arc::new(LockCoordinator::new(
            Arc::new(MemoryLeaseStore::new()),
            "instance-a",
            clock.clone(),
        ));
        let elector = Arc::new(LeaderElector::new(locks, CoordinationConfig::default()));
        let scheduler = Arc::new(PollingScheduler::new(
            PollingSettings::default(),
            store.clone(),
            Arc::new(NoopClient),
            Arc::new(RateLimiter::new(RateLimitConfig::default(), clock.clone())),
            Arc::new(ChannelBroadcaster::new(16)),
            clock.clone(),
        ));
        let queue = Arc::new(PublishQueue::new(
            Arc::new(MemoryQueueBackend::new()),
            store.clone(),
            clock.clone(),
        ));
        (AppState::new(elector, scheduler, queue, clock), store)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = test_state();
        let response = create_router(state)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["status"], "healthy");
        assert_eq!(json["data"]["instance_id"], "instance-a");
    }

    #[tokio::test]
    async fn test_status_reports_follower() {
        let (state, _) = test_state();
        let response = create_router(state)
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["data"]["role"], "follower");
        assert_eq!(json["data"]["queue"]["backend"], "memory");
        assert_eq!(json["data"]["polling"]["running"], false);
    }

    #[tokio::test]
    async fn test_schedule_and_cancel() {
        let (state, store) = test_state();
        let router = create_router(state);
        let body = serde_json::json!({
            "workspace_id": "ws-1",
            "account_id": "acct-1",
            "platform": "instagram",
            "scheduled_at": "2030-01-01T09:00:00Z",
            "caption": "hello",
            "media_refs": ["https://cdn.example.com/a.jpg"]
        });

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/content/c-1/schedule")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["data"]["queued"], true);
        assert!(store.get_content("c-1").await.unwrap().is_some());

        let response = router
            .clone()
            .oneshot(
                Request::delete("/api/content/c-1/schedule")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::delete("/api/content/c-1/schedule")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_activity_for_unknown_account() {
        let (state, store) = test_state();
        store
            .save_polling_config(&PollingConfig::new("acct-1", "ws-1", "cred-1"))
            .await
            .unwrap();
        let router = create_router(state);

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/accounts/acct-1/activity")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::post("/api/accounts/nope/activity")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
