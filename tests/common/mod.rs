//! Common test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use tokio::sync::Notify;

use cadence::clock::{ManualClock, SharedClock};
use cadence::models::{AccountStats, AnalyticsSnapshot, ContentRecord, Credential, PollingConfig};
use cadence::platform::{PlatformError, PublishReceipt, PublishRequest, SocialPlatformClient};
use cadence::storage::{
    AttemptFailure, ContentStore, MemoryContentStore, StorageError, StorageResult, UpsertOutcome,
};

/// Fixed daytime start so night windows never interfere
pub fn test_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap())
}

pub fn shared(clock: &ManualClock) -> SharedClock {
    Arc::new(clock.clone())
}

pub fn stats(followers: u64, media: u64, engagement: f64) -> AccountStats {
    AccountStats {
        follower_count: followers,
        media_count: media,
        engagement,
    }
}

/// Store with a credential and polling config for `account_id`
pub async fn store_with_account(account_id: &str) -> Arc<MemoryContentStore> {
    let store = Arc::new(MemoryContentStore::new());
    add_account(&store, account_id).await;
    store
}

pub async fn add_account(store: &MemoryContentStore, account_id: &str) {
    let credential_ref = format!("cred-{account_id}");
    store
        .insert_credential(
            credential_ref.clone(),
            Credential {
                account_id: account_id.to_string(),
                access_token: format!("token-{account_id}"),
            },
        )
        .await;
    store
        .save_polling_config(&PollingConfig::new(account_id, "ws-1", credential_ref))
        .await
        .unwrap();
}

/// Scripted outcome of one platform call
#[derive(Debug, Clone)]
pub enum Scripted {
    Stats(AccountStats),
    Status(u16),
}

/// In-process stand-in for the platform API
///
/// Stats calls consume the script in order and repeat the last entry.
/// Publish calls fail with the queued statuses, then succeed.
#[derive(Default)]
pub struct FakePlatform {
    stats: Mutex<Vec<Scripted>>,
    publish_failures: Mutex<Vec<u16>>,
    gate: Mutex<Option<Arc<PublishGate>>>,
    pub stats_calls: AtomicUsize,
    pub publish_calls: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(script: Vec<Scripted>) -> Self {
        Self {
            stats: Mutex::new(script),
            ..Default::default()
        }
    }

    pub fn fail_publishes(&self, statuses: &[u16]) {
        self.publish_failures.lock().unwrap().extend_from_slice(statuses);
    }

    /// Hold every following publish call until the gate is released
    pub fn hold_publishes(&self) -> Arc<PublishGate> {
        let gate = Arc::new(PublishGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocialPlatformClient for FakePlatform {
    async fn fetch_account_stats(&self, _: &Credential) -> Result<AccountStats, PlatformError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.stats.lock().unwrap();
        let next = match script.len() {
            0 => Scripted::Stats(AccountStats::default()),
            1 => script[0].clone(),
            _ => script.remove(0),
        };
        match next {
            Scripted::Stats(stats) => Ok(stats),
            Scripted::Status(status) => Err(PlatformError::from_status(status, "scripted", None)),
        }
    }

    async fn publish(
        &self,
        credential: &Credential,
        _: &PublishRequest,
    ) -> Result<PublishReceipt, PlatformError> {
        let n = self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let failure = {
            let mut failures = self.publish_failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        match failure {
            Some(status) => Err(PlatformError::from_status(status, "scripted", None)),
            None => Ok(PublishReceipt {
                external_id: format!("{}-post-{n}", credential.account_id),
            }),
        }
    }
}

/// Pauses a publish call mid-flight
#[derive(Default)]
pub struct PublishGate {
    entered: Notify,
    release: Notify,
}

impl PublishGate {
    /// Wait until a publish call is inside the platform
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Memory store whose polling-state writes can be made to fail
pub struct FlakyStore {
    pub inner: MemoryContentStore,
    fail_saves: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: MemoryContentStore) -> Self {
        Self {
            inner,
            fail_saves: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` polling config saves
    pub fn fail_next_saves(&self, n: usize) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentStore for FlakyStore {
    async fn upsert_content(&self, record: &ContentRecord) -> StorageResult<UpsertOutcome> {
        self.inner.upsert_content(record).await
    }

    async fn get_content(&self, content_id: &str) -> StorageResult<Option<ContentRecord>> {
        self.inner.get_content(content_id).await
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<ContentRecord>> {
        self.inner.list_due(now, limit).await
    }

    async fn claim_for_publish(
        &self,
        content_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StorageResult<Option<ContentRecord>> {
        self.inner.claim_for_publish(content_id, now, stale_after).await
    }

    async fn mark_published(
        &self,
        content_id: &str,
        claimed_at: DateTime<Utc>,
        external_post_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        self.inner
            .mark_published(content_id, claimed_at, external_post_id, now)
            .await
    }

    async fn record_failed_attempt(
        &self,
        content_id: &str,
        claimed_at: DateTime<Utc>,
        failure: &AttemptFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ContentRecord>> {
        self.inner
            .record_failed_attempt(content_id, claimed_at, failure, now)
            .await
    }

    async fn cancel_content(&self, content_id: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        self.inner.cancel_content(content_id, now).await
    }

    async fn list_polling_configs(&self) -> StorageResult<Vec<PollingConfig>> {
        self.inner.list_polling_configs().await
    }

    async fn get_polling_config(&self, account_id: &str) -> StorageResult<Option<PollingConfig>> {
        self.inner.get_polling_config(account_id).await
    }

    async fn save_polling_config(&self, config: &PollingConfig) -> StorageResult<()> {
        let failing = self
            .fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable("db blip".to_string()));
        }
        self.inner.save_polling_config(config).await
    }

    async fn delete_polling_config(&self, account_id: &str) -> StorageResult<bool> {
        self.inner.delete_polling_config(account_id).await
    }

    async fn record_user_activity(&self, account_id: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        self.inner.record_user_activity(account_id, at).await
    }

    async fn insert_snapshot_if_absent(&self, snapshot: &AnalyticsSnapshot) -> StorageResult<bool> {
        self.inner.insert_snapshot_if_absent(snapshot).await
    }

    async fn get_snapshot(
        &self,
        account_id: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<AnalyticsSnapshot>> {
        self.inner.get_snapshot(account_id, date).await
    }

    async fn resolve_credential(&self, credential_ref: &str) -> StorageResult<Option<Credential>> {
        self.inner.resolve_credential(credential_ref).await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.inner.ping().await
    }
}
