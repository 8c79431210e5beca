//! Idempotent content publishing
//!
//! [`ContentPublisher`] is the single code path that calls the platform's
//! publish endpoint, shared by the queue worker and the fallback sweep.
//! The record is claimed with a conditional update before the call and
//! committed with another after it, so a redelivered job or a concurrent
//! sweep never publishes the same content twice.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::config::PublishConfig;
use super::error::PublishResult;
use crate::clock::SharedClock;
use crate::metrics;
use crate::models::{ContentRecord, ContentStatus};
use crate::platform::{PlatformError, PublishRequest, SocialPlatformClient};
use crate::storage::{AttemptFailure, ContentStore};

/// Which path triggered a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPath {
    Queue,
    Fallback,
}

impl PublishPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Fallback => "fallback",
        }
    }
}

/// Why a publish was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No record with this id
    Missing,
    /// Published, failed, canceled or carrying an external id
    NotPublishable,
    /// Another worker holds a live claim
    ClaimedElsewhere,
    /// The claim was lost before the result could be committed
    CommitConflict,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::NotPublishable => "not_publishable",
            Self::ClaimedElsewhere => "claimed_elsewhere",
            Self::CommitConflict => "commit_conflict",
        }
    }
}

/// Result of one publish attempt
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published { external_id: String },
    /// Record not due yet; try again at its scheduled time
    NotDue { scheduled_at: chrono::DateTime<chrono::Utc> },
    Skipped(SkipReason),
    /// Transient failure; the record is back in `scheduled`
    Retrying { attempt_count: u32, reason: String },
    /// Terminal failure; the record is `failed`
    Failed { attempt_count: u32, reason: String },
}

impl PublishOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::NotDue { .. } => "not_due",
            Self::Skipped(_) => "skipped",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether the job that produced this outcome is finished with
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Retrying { .. } | Self::NotDue { .. })
    }
}

/// Publishes one content record with the idempotency guard
pub struct ContentPublisher {
    store: Arc<dyn ContentStore>,
    client: Arc<dyn SocialPlatformClient>,
    clock: SharedClock,
    config: PublishConfig,
}

impl ContentPublisher {
    pub fn new(
        store: Arc<dyn ContentStore>,
        client: Arc<dyn SocialPlatformClient>,
        clock: SharedClock,
        config: PublishConfig,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    /// Publish a content record unless it is already settled
    ///
    /// Storage errors are returned; platform errors are recorded on the
    /// record and reported through the outcome.
    pub async fn publish(&self, content_id: &str, path: PublishPath) -> PublishResult<PublishOutcome> {
        let outcome = self.publish_inner(content_id).await;
        match &outcome {
            Ok(outcome) => metrics::record_publish(path.as_str(), outcome.label()),
            Err(_) => metrics::record_publish(path.as_str(), "error"),
        }
        outcome
    }

    async fn publish_inner(&self, content_id: &str) -> PublishResult<PublishOutcome> {
        let now = self.clock.now();

        let Some(record) = self.store.get_content(content_id).await? else {
            debug!(content_id, "Content not found, skipping publish");
            return Ok(PublishOutcome::Skipped(SkipReason::Missing));
        };

        if record.external_post_id.is_some()
            || !matches!(record.status, ContentStatus::Scheduled | ContentStatus::Active)
        {
            debug!(content_id, status = %record.status, "Content already settled, skipping publish");
            return Ok(PublishOutcome::Skipped(SkipReason::NotPublishable));
        }

        if !record.is_due(now) {
            return Ok(PublishOutcome::NotDue {
                scheduled_at: record.scheduled_at,
            });
        }

        let Some(claimed) = self
            .store
            .claim_for_publish(content_id, now, self.config.stale_claim())
            .await?
        else {
            debug!(content_id, "Content claimed by another worker");
            return Ok(PublishOutcome::Skipped(SkipReason::ClaimedElsewhere));
        };

        // The claim timestamp settles the attempt; a reclaim replaces it
        let Some(claimed_at) = claimed.claimed_at else {
            return Ok(PublishOutcome::Skipped(SkipReason::ClaimedElsewhere));
        };

        match self.call_platform(&claimed).await {
            Ok(external_id) => self.commit(&claimed, claimed_at, external_id).await,
            Err(err) => self.record_failure(&claimed, claimed_at, err).await,
        }
    }

    async fn call_platform(&self, record: &ContentRecord) -> Result<String, PlatformError> {
        let credential_ref = match self.store.get_polling_config(&record.account_id).await {
            Ok(Some(config)) => config.credential_ref,
            Ok(None) => record.account_id.clone(),
            Err(e) => {
                warn!(account_id = %record.account_id, error = %e, "Polling config lookup failed, using account id");
                record.account_id.clone()
            }
        };

        let credential = match self.store.resolve_credential(&credential_ref).await {
            Ok(Some(credential)) => credential,
            Ok(None) => return Err(PlatformError::MissingCredential(record.account_id.clone())),
            Err(e) => {
                // Counted as a transient attempt failure
                return Err(PlatformError::InvalidResponse(format!(
                    "credential lookup failed: {e}"
                )));
            }
        };

        let request = PublishRequest {
            media_refs: record.media_refs.clone(),
            caption: record.caption.clone(),
            media_type: record.media_type(),
        };

        let receipt = self.client.publish(&credential, &request).await?;
        Ok(receipt.external_id)
    }

    async fn commit(
        &self,
        record: &ContentRecord,
        claimed_at: DateTime<Utc>,
        external_id: String,
    ) -> PublishResult<PublishOutcome> {
        let committed = self
            .store
            .mark_published(&record.content_id, claimed_at, &external_id, self.clock.now())
            .await?;

        if !committed {
            error!(
                content_id = %record.content_id,
                external_id = %external_id,
                "Published but lost the claim before commit"
            );
            return Ok(PublishOutcome::Skipped(SkipReason::CommitConflict));
        }

        info!(
            content_id = %record.content_id,
            platform = %record.platform,
            external_id = %external_id,
            "Content published"
        );
        Ok(PublishOutcome::Published { external_id })
    }

    async fn record_failure(
        &self,
        record: &ContentRecord,
        claimed_at: DateTime<Utc>,
        err: PlatformError,
    ) -> PublishResult<PublishOutcome> {
        let failure = AttemptFailure {
            reason: err.to_string(),
            permanent: err.is_permanent(),
            max_attempts: self.config.max_attempts,
        };

        let Some(updated) = self
            .store
            .record_failed_attempt(&record.content_id, claimed_at, &failure, self.clock.now())
            .await?
        else {
            return Ok(PublishOutcome::Skipped(SkipReason::CommitConflict));
        };

        if updated.status == ContentStatus::Failed {
            error!(
                content_id = %record.content_id,
                attempts = updated.attempt_count,
                permanent = failure.permanent,
                reason = %failure.reason,
                "Publish failed permanently"
            );
            Ok(PublishOutcome::Failed {
                attempt_count: updated.attempt_count,
                reason: failure.reason,
            })
        } else {
            warn!(
                content_id = %record.content_id,
                attempts = updated.attempt_count,
                reason = %failure.reason,
                "Publish attempt failed, will retry"
            );
            Ok(PublishOutcome::Retrying {
                attempt_count: updated.attempt_count,
                reason: failure.reason,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::{AccountStats, Credential, Platform, PollingConfig};
    use crate::platform::PublishReceipt;
    use crate::storage::MemoryContentStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeClient {
        calls: AtomicUsize,
        failures: Mutex<Vec<u16>>,
    }

    impl FakeClient {
        fn failing_with(statuses: Vec<u16>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: Mutex::new(statuses),
            }
        }
    }

    #[async_trait]
    impl SocialPlatformClient for FakeClient {
        async fn fetch_account_stats(&self, _: &Credential) -> Result<AccountStats, PlatformError> {
            Ok(AccountStats::default())
        }

        async fn publish(&self, _: &Credential, _: &PublishRequest) -> Result<PublishReceipt, PlatformError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                let status = failures.remove(0);
                return Err(PlatformError::from_status(status, "fake", None));
            }
            Ok(PublishReceipt {
                external_id: format!("post-{call}"),
            })
        }
    }

    async fn setup(failures: Vec<u16>) -> (ContentPublisher, Arc<MemoryContentStore>, Arc<FakeClient>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryContentStore::new());
        store
            .save_polling_config(&PollingConfig::new("acct-1", "ws-1", "cred-1"))
            .await
            .unwrap();
        store
            .insert_credential(
                "cred-1",
                Credential {
                    account_id: "acct-1".to_string(),
                    access_token: "token".to_string(),
                },
            )
            .await;
        store
            .upsert_content(
                &ContentRecord::new("c-1", "ws-1", "acct-1", Platform::Instagram, clock.now())
                    .with_media("https://cdn.example.com/a.jpg"),
            )
            .await
            .unwrap();

        let client = Arc::new(FakeClient::failing_with(failures));
        let publisher = ContentPublisher::new(
            store.clone(),
            client.clone(),
            Arc::new(clock.clone()),
            PublishConfig::default(),
        );
        (publisher, store, client, clock)
    }

    #[tokio::test]
    async fn test_publish_once() {
        let (publisher, store, client, _) = setup(vec![]).await;

        let first = publisher.publish("c-1", PublishPath::Queue).await.unwrap();
        assert!(matches!(first, PublishOutcome::Published { .. }));

        let second = publisher.publish("c-1", PublishPath::Fallback).await.unwrap();
        assert_eq!(second, PublishOutcome::Skipped(SkipReason::NotPublishable));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        let record = store.get_content("c-1").await.unwrap().unwrap();
        assert_eq!(record.status, ContentStatus::Published);
        assert_eq!(record.external_post_id.as_deref(), Some("post-0"));
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let (publisher, store, _, _) = setup(vec![503]).await;

        let first = publisher.publish("c-1", PublishPath::Queue).await.unwrap();
        assert!(matches!(first, PublishOutcome::Retrying { attempt_count: 1, .. }));

        let second = publisher.publish("c-1", PublishPath::Queue).await.unwrap();
        assert!(matches!(second, PublishOutcome::Published { .. }));
        assert_eq!(store.get_content("c-1").await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_immediately() {
        let (publisher, store, _, _) = setup(vec![403]).await;

        let outcome = publisher.publish("c-1", PublishPath::Queue).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Failed { attempt_count: 1, .. }));

        let record = store.get_content("c-1").await.unwrap().unwrap();
        assert_eq!(record.status, ContentStatus::Failed);
        assert!(record.failure_reason.unwrap().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_not_due_is_not_claimed() {
        let (publisher, store, client, clock) = setup(vec![]).await;
        store
            .upsert_content(&ContentRecord::new(
                "c-2",
                "ws-1",
                "acct-1",
                Platform::Instagram,
                clock.now() + Duration::hours(1),
            ))
            .await
            .unwrap();

        let outcome = publisher.publish("c-2", PublishPath::Queue).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::NotDue { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get_content("c-2").await.unwrap().unwrap().status,
            ContentStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn test_live_claim_blocks_second_worker() {
        let (publisher, store, client, clock) = setup(vec![]).await;
        store
            .claim_for_publish("c-1", clock.now(), Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();

        let outcome = publisher.publish("c-1", PublishPath::Fallback).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Skipped(SkipReason::ClaimedElsewhere));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);

        // Once the claim is stale it can be taken over
        clock.advance(Duration::minutes(11));
        let outcome = publisher.publish("c-1", PublishPath::Fallback).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn test_missing_credential_is_permanent() {
        let (publisher, store, client, clock) = setup(vec![]).await;
        store
            .upsert_content(&ContentRecord::new(
                "c-3",
                "ws-1",
                "acct-unknown",
                Platform::Facebook,
                clock.now(),
            ))
            .await
            .unwrap();

        let outcome = publisher.publish("c-3", PublishPath::Queue).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Failed { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
