//! Prometheus metrics for cadence
//!
//! This module provides metrics tracking for:
//! - Coordination: lease acquisitions, renewals, losses, leader role
//! - Polling: poll outcomes, rate-limit deferrals, active account loops
//! - Publishing: publish outcomes by path (queue worker or fallback sweep)
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for coordination metrics
struct CoordinationMetrics {
    lease_events: CounterVec,
    is_leader: Gauge,
}

/// Container for polling and publishing metrics
struct WorkMetrics {
    polls: CounterVec,
    api_duration: HistogramVec,
    deferrals: CounterVec,
    active_accounts: Gauge,
    publishes: CounterVec,
    fallback_due: Gauge,
}

static COORDINATION_METRICS: OnceLock<CoordinationMetrics> = OnceLock::new();

static WORK_METRICS: OnceLock<WorkMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations
/// become no-ops.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let coordination = CoordinationMetrics {
        lease_events: register_counter_vec!(
            "cadence_lease_events_total",
            "Lease lifecycle events by lease name and event",
            &["lease", "event"]
        )?,
        is_leader: register_gauge!(
            "cadence_is_leader",
            "Whether this instance currently holds leadership (1 = leader)"
        )?,
    };

    let work = WorkMetrics {
        polls: register_counter_vec!(
            "cadence_polls_total",
            "Account poll ticks by outcome",
            &["outcome"]
        )?,
        api_duration: register_histogram_vec!(
            "cadence_api_duration_seconds",
            "Time spent in platform API calls",
            &["call"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
        deferrals: register_counter_vec!(
            "cadence_rate_limit_deferrals_total",
            "Poll ticks deferred by the rate limiter, by blocking check",
            &["reason"]
        )?,
        active_accounts: register_gauge!(
            "cadence_polling_accounts",
            "Number of account polling loops currently running"
        )?,
        publishes: register_counter_vec!(
            "cadence_publish_attempts_total",
            "Publish attempts by delivery path and outcome",
            &["path", "outcome"]
        )?,
        fallback_due: register_gauge!(
            "cadence_fallback_due_items",
            "Due content items seen by the last fallback sweep"
        )?,
    };

    COORDINATION_METRICS
        .set(coordination)
        .map_err(|_| "Coordination metrics already initialized")?;
    WORK_METRICS
        .set(work)
        .map_err(|_| "Work metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    COORDINATION_METRICS.get().is_some() && WORK_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a lease event (acquired, rejected, error, renewed, lost, released)
pub fn record_lease_event(lease: &str, event: &str) {
    if let Some(m) = COORDINATION_METRICS.get() {
        m.lease_events.with_label_values(&[lease, event]).inc();
    }
}

/// Update the leader gauge
pub fn set_leader(is_leader: bool) {
    if let Some(m) = COORDINATION_METRICS.get() {
        m.is_leader.set(if is_leader { 1.0 } else { 0.0 });
    }
}

/// Record a poll tick outcome (changed, unchanged, deferred, error)
pub fn record_poll(outcome: &str) {
    if let Some(m) = WORK_METRICS.get() {
        m.polls.with_label_values(&[outcome]).inc();
    }
}

/// Record a rate-limit deferral
pub fn record_deferral(reason: &str) {
    if let Some(m) = WORK_METRICS.get() {
        m.deferrals.with_label_values(&[reason]).inc();
    }
}

/// Update number of running account loops
pub fn set_active_accounts(count: usize) {
    if let Some(m) = WORK_METRICS.get() {
        m.active_accounts.set(count as f64);
    }
}

/// Record a publish attempt outcome
pub fn record_publish(path: &str, outcome: &str) {
    if let Some(m) = WORK_METRICS.get() {
        m.publishes.with_label_values(&[path, outcome]).inc();
    }
}

/// Record how many due items the fallback sweep saw
pub fn set_fallback_due(count: usize) {
    if let Some(m) = WORK_METRICS.get() {
        m.fallback_due.set(count as f64);
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a platform API call timer
pub fn start_api_timer(call: &str) -> MetricsTimer {
    match WORK_METRICS.get() {
        Some(m) => MetricsTimer::new(m.api_duration.with_label_values(&[call]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
