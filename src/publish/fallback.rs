//! Timer-driven fallback publishing
//!
//! Scans the content store for due `scheduled` records and publishes them
//! directly. While the queue is reachable, records that still have a job
//! there are left to the worker; everything else (the queue is down, the
//! enqueue never happened, the job was lost) is published here through
//! the same idempotency guard.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::FallbackConfig;
use super::error::PublishResult;
use super::publisher::{ContentPublisher, PublishOutcome, PublishPath};
use super::queue::PublishQueue;
use crate::clock::SharedClock;
use crate::metrics;
use crate::storage::ContentStore;

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Due records found
    pub due: usize,
    /// Left to the queue worker
    pub queued: usize,
    pub published: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Records whose publish attempt errored before completing
    pub errors: usize,
}

pub struct FallbackScheduler {
    queue: Arc<PublishQueue>,
    publisher: Arc<ContentPublisher>,
    store: Arc<dyn ContentStore>,
    clock: SharedClock,
    config: FallbackConfig,
}

impl FallbackScheduler {
    pub fn new(
        queue: Arc<PublishQueue>,
        publisher: Arc<ContentPublisher>,
        store: Arc<dyn ContentStore>,
        clock: SharedClock,
        config: FallbackConfig,
    ) -> Self {
        Self {
            queue,
            publisher,
            store,
            clock,
            config,
        }
    }

    /// Run one sweep over due content
    pub async fn sweep(&self) -> PublishResult<SweepReport> {
        let reachable = self.queue.is_reachable().await;
        if reachable && !self.config.always_sweep {
            debug!("Queue reachable, skipping fallback sweep");
            return Ok(SweepReport::default());
        }

        let due = self
            .store
            .list_due(self.clock.now(), self.config.batch_size)
            .await?;
        metrics::set_fallback_due(due.len());

        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };

        for record in due {
            if reachable && self.job_pending(&record.content_id).await {
                report.queued += 1;
                continue;
            }

            match self
                .publisher
                .publish(&record.content_id, PublishPath::Fallback)
                .await
            {
                Ok(PublishOutcome::Published { .. }) => report.published += 1,
                Ok(PublishOutcome::Retrying { .. }) => report.retrying += 1,
                Ok(PublishOutcome::Failed { .. }) => report.failed += 1,
                Ok(PublishOutcome::Skipped(_)) | Ok(PublishOutcome::NotDue { .. }) => {
                    report.skipped += 1
                }
                Err(e) => {
                    warn!(content_id = %record.content_id, error = %e, "Fallback publish errored");
                    report.errors += 1;
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                queued = report.queued,
                published = report.published,
                retrying = report.retrying,
                failed = report.failed,
                queue_reachable = reachable,
                "Fallback sweep finished"
            );
        }
        Ok(report)
    }

    /// A failed lookup counts as "no job"; the claim still prevents duplicates
    async fn job_pending(&self, content_id: &str) -> bool {
        match self.queue.has_job(content_id).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!(content_id, error = %e, "Job lookup failed");
                false
            }
        }
    }

    /// Sweep every `tick_secs` until `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick_secs,
            always_sweep = self.config.always_sweep,
            "Fallback scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Fallback sweep failed");
                    }
                }
            }
        }

        info!("Fallback scheduler stopped");
    }
}
