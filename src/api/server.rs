//! Control plane server
//!
//! Builds the router with CORS and request tracing and serves it until the
//! shutdown signal fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::create_router;
use crate::clock::SharedClock;
use crate::config::ServerConfig;
use crate::coordination::LeaderElector;
use crate::polling::PollingScheduler;
use crate::publish::PublishQueue;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Leader election (role and held leases)
    pub elector: Arc<LeaderElector>,

    /// Polling scheduler (account loops, activity signal)
    pub scheduler: Arc<PollingScheduler>,

    /// Publish queue (schedule/cancel)
    pub queue: Arc<PublishQueue>,

    pub clock: SharedClock,

    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        elector: Arc<LeaderElector>,
        scheduler: Arc<PollingScheduler>,
        queue: Arc<PublishQueue>,
        clock: SharedClock,
    ) -> Self {
        Self {
            elector,
            scheduler,
            queue,
            clock,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    ServeError(String),
}

/// HTTP control plane
pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router with all routes and layers
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone()).layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr: SocketAddr = self
            .config
            .bind_address
            .parse()
            .map_err(|_| ServerError::InvalidAddress(self.config.bind_address.clone()))?;
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;
        tracing::info!(%addr, "Control plane listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        tracing::info!("Control plane shutdown complete");
        Ok(())
    }
}
