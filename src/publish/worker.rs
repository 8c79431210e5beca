//! Queue consumer
//!
//! Reserves jobs from the [`PublishQueue`] and hands them to the
//! [`ContentPublisher`] with bounded concurrency. Settled jobs are
//! acknowledged; transient failures go back to the queue with exponential
//! backoff. A worker that dies mid-job simply never acks, and the job is
//! redelivered after the visibility timeout.

use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::config::PublishConfig;
use super::error::QueueResult;
use super::job::Delivery;
use super::publisher::{ContentPublisher, PublishOutcome, PublishPath};
use super::queue::PublishQueue;

/// What the worker did with a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum WorkResult {
    /// Job acknowledged and removed
    Acked(PublishOutcome),
    /// Job returned to the queue for a later attempt
    Requeued(PublishOutcome),
    /// Publisher errored; job returned with backoff
    Errored(String),
}

pub struct PublishWorker {
    queue: Arc<PublishQueue>,
    publisher: Arc<ContentPublisher>,
    config: PublishConfig,
    permits: Arc<Semaphore>,
}

impl PublishWorker {
    pub fn new(queue: Arc<PublishQueue>, publisher: Arc<ContentPublisher>, config: PublishConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            queue,
            publisher,
            config,
            permits,
        }
    }

    /// Process one delivery to completion
    pub async fn process(&self, delivery: &Delivery) -> WorkResult {
        let content_id = delivery.job.content_id.as_str();
        debug!(content_id, delivery = delivery.deliveries, "Processing publish job");

        match self.publisher.publish(content_id, PublishPath::Queue).await {
            Ok(PublishOutcome::NotDue { scheduled_at }) => {
                self.settle(self.queue.retry_at(delivery, scheduled_at).await, delivery);
                WorkResult::Requeued(PublishOutcome::NotDue { scheduled_at })
            }
            Ok(outcome) if outcome.is_settled() => {
                self.settle(self.queue.ack(delivery).await, delivery);
                WorkResult::Acked(outcome)
            }
            Ok(outcome) => {
                let delay = self.config.retry_delay(delivery.deliveries);
                self.settle(self.queue.retry_later(delivery, delay).await, delivery);
                WorkResult::Requeued(outcome)
            }
            Err(e) => {
                let delay = self.config.retry_delay(delivery.deliveries);
                warn!(
                    content_id,
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "Publish job errored"
                );
                self.settle(self.queue.retry_later(delivery, delay).await, delivery);
                WorkResult::Errored(e.to_string())
            }
        }
    }

    fn settle(&self, result: QueueResult<bool>, delivery: &Delivery) {
        match result {
            Ok(true) => {}
            Ok(false) => debug!(
                content_id = %delivery.job.content_id,
                "Job was replaced or canceled while in flight"
            ),
            Err(e) => warn!(
                content_id = %delivery.job.content_id,
                error = %e,
                "Failed to settle job; it will be redelivered"
            ),
        }
    }

    /// Consume jobs until `shutdown` flips to `true`
    ///
    /// In-flight jobs are awaited before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.worker_concurrency,
            backend = self.queue.backend().name(),
            "Publish worker started"
        );
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.try_join_next().is_some() {}

            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = match self.queue.reserve(self.config.visibility_timeout()).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    if Self::idle(&mut shutdown, self.config.idle_poll()).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Failed to reserve publish job");
                    if Self::idle(&mut shutdown, self.config.idle_poll() * 5).await {
                        break;
                    }
                    continue;
                }
            };

            let worker = Arc::clone(&self);
            in_flight.spawn(async move {
                worker.process(&delivery).await;
                drop(permit);
            });
        }

        while in_flight.join_next().await.is_some() {}
        info!("Publish worker stopped");
    }

    /// Sleep unless shutdown arrives first; returns `true` on shutdown
    async fn idle(shutdown: &mut watch::Receiver<bool>, duration: std::time::Duration) -> bool {
        tokio::select! {
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
