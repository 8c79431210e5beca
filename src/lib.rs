//! cadence - Leader-elected social account polling and scheduled publishing
//!
//! Runs as a fleet of identical instances sharing PostgreSQL (and optionally
//! Redis). One instance at a time is elected to poll account statistics;
//! every instance publishes scheduled content exactly once.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`coordination`] - Lease store, lock coordinator and leader election
//! - [`ratelimit`] - Multi-tier platform request quota
//! - [`platform`] - Social platform API client
//! - [`polling`] - Adaptive per-account polling on the leader
//! - [`publish`] - Job queue, worker and fallback publishing
//! - [`storage`] - Content, polling state and credential storage
//! - [`events`] - Change notifications
//! - [`metrics`] - Prometheus metrics
//! - [`api`] - HTTP control plane
//! - [`service`] - Component wiring and task lifecycle
//!
//! # Example
//!
//! ```no_run
//! use cadence::config::Config;
//! use cadence::service::Service;
//!
//! #[tokio::main]
//! async fn main() -> cadence::Result<()> {
//!     let config = Config::from_env()?;
//!     let service = Service::build(config).await?;
//!     service.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! }
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod platform;
pub mod polling;
pub mod publish;
pub mod ratelimit;
pub mod service;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::coordination::{LeaderElector, LockCoordinator, Role};
    pub use crate::error::{CadenceErrorTrait, Error, ErrorCategory, Result};
    pub use crate::models::{AccountStats, ContentRecord, ContentStatus, Platform, PollingConfig};
    pub use crate::polling::PollingScheduler;
    pub use crate::publish::{ContentPublisher, FallbackScheduler, PublishQueue, PublishWorker};
    pub use crate::ratelimit::RateLimiter;
    pub use crate::service::Service;
    pub use crate::storage::ContentStore;
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{ContentRecord, ContentStatus, Platform, PollingConfig};
