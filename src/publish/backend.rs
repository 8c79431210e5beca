//! Job queue backends
//!
//! A [`QueueBackend`] stores at most one pending job per content id.
//! Enqueueing again replaces the job (and its ready time). Reserved jobs
//! that are not acknowledged before their visibility deadline become
//! deliverable again, which gives at-least-once delivery.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use super::config::RedisConfig;
use super::error::QueueResult;
use super::job::{Delivery, PublishJob};
use super::redis_queue::RedisQueueBackend;

/// Storage and delivery of scheduled publish jobs
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short backend name for logs and status
    fn name(&self) -> &'static str;

    /// Whether jobs survive a process restart
    fn is_durable(&self) -> bool;

    /// Add or replace the job for `job.content_id`, deliverable at `ready_at`
    async fn enqueue(&self, job: &PublishJob, ready_at: DateTime<Utc>) -> QueueResult<()>;

    /// Remove the job in any state; returns whether one existed
    async fn cancel(&self, content_id: &str) -> QueueResult<bool>;

    /// Whether a job exists for the content id (pending or reserved)
    async fn has_job(&self, content_id: &str) -> QueueResult<bool>;

    /// Take the earliest ready job, hiding it until `now + visibility`
    async fn reserve(&self, now: DateTime<Utc>, visibility: Duration) -> QueueResult<Option<Delivery>>;

    /// Remove a delivered job; returns `false` when the receipt is stale
    async fn ack(&self, content_id: &str, receipt: &str) -> QueueResult<bool>;

    /// Return a delivered job to the queue, deliverable at `ready_at`
    async fn nack(&self, content_id: &str, receipt: &str, ready_at: DateTime<Utc>) -> QueueResult<bool>;

    /// Number of jobs held (pending and reserved)
    async fn len(&self) -> QueueResult<usize>;

    /// Reachability probe
    async fn is_reachable(&self) -> bool;
}

/// Pick the queue backend once at startup
///
/// Uses Redis when it is configured and answers `PING`, otherwise falls
/// back to the in-process backend.
pub async fn select_backend(config: &RedisConfig) -> Arc<dyn QueueBackend> {
    if !config.is_enabled() {
        info!("Redis not configured, using in-memory publish queue");
        return Arc::new(MemoryQueueBackend::new());
    }

    match RedisQueueBackend::connect(config).await {
        Ok(backend) => {
            info!(url = %config.url, "Using Redis publish queue");
            Arc::new(backend)
        }
        Err(e) => {
            warn!(error = %e, "Redis unavailable, using in-memory publish queue");
            Arc::new(MemoryQueueBackend::new())
        }
    }
}

// ============================================================================
// In-Memory Backend
// ============================================================================

#[derive(Debug, Clone)]
struct QueuedJob {
    job: PublishJob,
    receipt: String,
    ready_at: DateTime<Utc>,
    reserved_until: Option<DateTime<Utc>>,
    deliveries: u32,
}

impl QueuedJob {
    /// Time at which the job can be handed out
    fn deliverable_at(&self) -> DateTime<Utc> {
        self.reserved_until.unwrap_or(self.ready_at)
    }
}

/// Process-local queue backend
///
/// Not durable: jobs live as long as the process. Used when Redis is
/// unavailable and in tests.
#[derive(Debug, Default)]
pub struct MemoryQueueBackend {
    jobs: Mutex<HashMap<String, QueuedJob>>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueuedJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ready time of the job for a content id
    pub fn ready_at(&self, content_id: &str) -> Option<DateTime<Utc>> {
        self.lock().get(content_id).map(|j| j.ready_at)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn enqueue(&self, job: &PublishJob, ready_at: DateTime<Utc>) -> QueueResult<()> {
        self.lock().insert(
            job.content_id.clone(),
            QueuedJob {
                job: job.clone(),
                receipt: Uuid::new_v4().to_string(),
                ready_at,
                reserved_until: None,
                deliveries: 0,
            },
        );
        Ok(())
    }

    async fn cancel(&self, content_id: &str) -> QueueResult<bool> {
        Ok(self.lock().remove(content_id).is_some())
    }

    async fn has_job(&self, content_id: &str) -> QueueResult<bool> {
        Ok(self.lock().contains_key(content_id))
    }

    async fn reserve(&self, now: DateTime<Utc>, visibility: Duration) -> QueueResult<Option<Delivery>> {
        let mut jobs = self.lock();
        let next = jobs
            .values_mut()
            .filter(|j| j.deliverable_at() <= now)
            .min_by(|a, b| {
                a.deliverable_at()
                    .cmp(&b.deliverable_at())
                    .then_with(|| a.job.content_id.cmp(&b.job.content_id))
            });

        Ok(next.map(|queued| {
            queued.reserved_until = Some(now + visibility);
            queued.deliveries += 1;
            Delivery {
                job: queued.job.clone(),
                deliveries: queued.deliveries,
                receipt: queued.receipt.clone(),
            }
        }))
    }

    async fn ack(&self, content_id: &str, receipt: &str) -> QueueResult<bool> {
        let mut jobs = self.lock();
        match jobs.get(content_id) {
            Some(queued) if queued.receipt == receipt => {
                jobs.remove(content_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn nack(&self, content_id: &str, receipt: &str, ready_at: DateTime<Utc>) -> QueueResult<bool> {
        match self.lock().get_mut(content_id) {
            Some(queued) if queued.receipt == receipt => {
                queued.reserved_until = None;
                queued.ready_at = ready_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn len(&self) -> QueueResult<usize> {
        Ok(self.lock().len())
    }

    async fn is_reachable(&self) -> bool {
        true
    }
}
