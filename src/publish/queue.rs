//! Scheduling front end over a [`QueueBackend`]

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::backend::QueueBackend;
use super::error::{PublishError, PublishResult, QueueResult};
use super::job::{Delivery, JobHandle, PublishJob};
use crate::clock::{to_chrono, to_std, SharedClock};
use crate::models::ContentRecord;
use crate::storage::{ContentStore, UpsertOutcome};

/// Schedules and cancels publish jobs
///
/// The content store is written first, so a job that never reaches the
/// queue is still found by the fallback sweep.
pub struct PublishQueue {
    backend: Arc<dyn QueueBackend>,
    store: Arc<dyn ContentStore>,
    clock: SharedClock,
}

impl PublishQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, store: Arc<dyn ContentStore>, clock: SharedClock) -> Self {
        Self {
            backend,
            store,
            clock,
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Persist a content record and enqueue its publish job
    ///
    /// The job becomes deliverable after `max(0, scheduled_at - now)`.
    /// Scheduling the same content id again replaces the pending job.
    /// Content that is published or mid-publish is refused and its job
    /// is left untouched.
    pub async fn schedule(&self, record: &ContentRecord) -> PublishResult<JobHandle> {
        match self.store.upsert_content(record).await? {
            UpsertOutcome::Stored => {}
            UpsertOutcome::Published => {
                return Err(PublishError::AlreadyPublished(record.content_id.clone()));
            }
            UpsertOutcome::InProgress => {
                return Err(PublishError::InProgress(record.content_id.clone()));
            }
        }

        let now = self.clock.now();
        let delay = (record.scheduled_at - now).max(Duration::zero());
        let ready_at = now + delay;

        let queued = match self
            .backend
            .enqueue(&PublishJob::from_record(record), ready_at)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    content_id = %record.content_id,
                    backend = self.backend.name(),
                    error = %e,
                    "Enqueue failed, relying on fallback sweep"
                );
                false
            }
        };

        info!(
            content_id = %record.content_id,
            scheduled_at = %record.scheduled_at,
            delay_secs = delay.num_seconds(),
            queued,
            "Content scheduled"
        );

        Ok(JobHandle {
            content_id: record.content_id.clone(),
            ready_at,
            delay: to_std(delay),
            queued,
            backend: self.backend.name(),
        })
    }

    /// Cancel pending publication of a content id
    ///
    /// Moves a still-`scheduled` record to `canceled`, then removes its
    /// queued job. Returns `false` when there was nothing to cancel,
    /// including content that is already being published; the job of
    /// such content stays queued so the running attempt can settle.
    pub async fn cancel(&self, content_id: &str) -> PublishResult<bool> {
        if !self.store.cancel_content(content_id, self.clock.now()).await? {
            return Ok(false);
        }

        // A job left behind is skipped by the worker once it sees the record
        let removed = match self.backend.cancel(content_id).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(content_id, error = %e, "Queue cancel failed");
                false
            }
        };

        info!(content_id, job_removed = removed, "Content canceled");
        Ok(true)
    }

    pub async fn has_job(&self, content_id: &str) -> QueueResult<bool> {
        self.backend.has_job(content_id).await
    }

    pub async fn is_reachable(&self) -> bool {
        self.backend.is_reachable().await
    }

    /// Reserve the next ready job for a worker
    pub async fn reserve(&self, visibility: std::time::Duration) -> QueueResult<Option<Delivery>> {
        self.backend
            .reserve(self.clock.now(), to_chrono(visibility))
            .await
    }

    pub async fn ack(&self, delivery: &Delivery) -> QueueResult<bool> {
        self.backend.ack(&delivery.job.content_id, &delivery.receipt).await
    }

    /// Return a delivery to the queue after `delay`
    pub async fn retry_later(&self, delivery: &Delivery, delay: std::time::Duration) -> QueueResult<bool> {
        let ready_at = self.clock.now() + to_chrono(delay);
        self.backend
            .nack(&delivery.job.content_id, &delivery.receipt, ready_at)
            .await
    }

    /// Return a delivery to the queue at a fixed time
    pub async fn retry_at(
        &self,
        delivery: &Delivery,
        ready_at: DateTime<Utc>,
    ) -> QueueResult<bool> {
        self.backend
            .nack(&delivery.job.content_id, &delivery.receipt, ready_at)
            .await
    }
}
