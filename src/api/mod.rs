//! HTTP control plane
//!
//! A small axum router for health, status, Prometheus metrics, content
//! scheduling and the user activity signal. Every instance serves it; the
//! handlers work the same on leaders and followers.

pub mod handlers;
pub mod server;

pub use handlers::{create_router, ApiResponse, ErrorResponse, ScheduleRequest};
pub use server::{ApiServer, AppState, ServerError};
