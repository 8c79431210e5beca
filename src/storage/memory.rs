//! In-process content store
//!
//! Used for single-node runs and tests. All transitions happen under one
//! lock, which gives the same conditional-update semantics as the SQL store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{AttemptFailure, ContentStore, StorageResult, UpsertOutcome};
use crate::models::{AnalyticsSnapshot, ContentRecord, ContentStatus, Credential, PollingConfig};

#[derive(Debug, Default)]
struct Tables {
    content: HashMap<String, ContentRecord>,
    polling: HashMap<String, PollingConfig>,
    snapshots: HashMap<(String, NaiveDate), AnalyticsSnapshot>,
    credentials: HashMap<String, Credential>,
}

/// Content store held in memory
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    tables: RwLock<Tables>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential under `credential_ref`
    pub async fn insert_credential(&self, credential_ref: impl Into<String>, credential: Credential) {
        self.tables
            .write()
            .await
            .credentials
            .insert(credential_ref.into(), credential);
    }

    /// Number of snapshots stored for an account
    pub async fn snapshot_count(&self, account_id: &str) -> usize {
        self.tables
            .read()
            .await
            .snapshots
            .keys()
            .filter(|(account, _)| account == account_id)
            .count()
    }
}

/// The record is still claimed by the claim taken at `claimed_at`
fn holds_claim(record: &ContentRecord, claimed_at: DateTime<Utc>) -> bool {
    record.status == ContentStatus::Active
        && record.external_post_id.is_none()
        && record.claimed_at == Some(claimed_at)
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn upsert_content(&self, record: &ContentRecord) -> StorageResult<UpsertOutcome> {
        let mut tables = self.tables.write().await;
        let mut record = record.clone();

        if let Some(existing) = tables.content.get(&record.content_id) {
            if existing.external_post_id.is_some() || existing.status == ContentStatus::Active {
                return Ok(UpsertOutcome::refused(existing));
            }
            // Retry history of a pending record survives rescheduling
            if existing.status == ContentStatus::Scheduled {
                record.attempt_count = record.attempt_count.max(existing.attempt_count);
                if record.failure_reason.is_none() {
                    record.failure_reason = existing.failure_reason.clone();
                }
            }
        }

        tables.content.insert(record.content_id.clone(), record);
        Ok(UpsertOutcome::Stored)
    }

    async fn get_content(&self, content_id: &str) -> StorageResult<Option<ContentRecord>> {
        Ok(self.tables.read().await.content.get(content_id).cloned())
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<ContentRecord>> {
        let tables = self.tables.read().await;
        let mut due: Vec<ContentRecord> = tables
            .content
            .values()
            .filter(|r| r.status == ContentStatus::Scheduled && r.scheduled_at <= now)
            .cloned()
            .collect();

        due.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_for_publish(
        &self,
        content_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StorageResult<Option<ContentRecord>> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables.content.get_mut(content_id) else {
            return Ok(None);
        };

        if record.external_post_id.is_some() {
            return Ok(None);
        }

        let claimable = match record.status {
            ContentStatus::Scheduled => true,
            ContentStatus::Active => record
                .claimed_at
                .map_or(true, |claimed| claimed <= now - stale_after),
            _ => false,
        };
        if !claimable {
            return Ok(None);
        }

        record.status = ContentStatus::Active;
        record.claimed_at = Some(now);
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn mark_published(
        &self,
        content_id: &str,
        claimed_at: DateTime<Utc>,
        external_post_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.content.get_mut(content_id) {
            Some(record) if holds_claim(record, claimed_at) => {
                record.status = ContentStatus::Published;
                record.external_post_id = Some(external_post_id.to_string());
                record.failure_reason = None;
                record.published_at = Some(now);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failed_attempt(
        &self,
        content_id: &str,
        claimed_at: DateTime<Utc>,
        failure: &AttemptFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ContentRecord>> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables.content.get_mut(content_id) else {
            return Ok(None);
        };

        if !holds_claim(record, claimed_at) {
            return Ok(None);
        }

        record.attempt_count = record.attempt_count.saturating_add(1);
        record.status = if failure.is_terminal_after(record.attempt_count) {
            ContentStatus::Failed
        } else {
            ContentStatus::Scheduled
        };
        record.failure_reason = Some(failure.reason.clone());
        record.claimed_at = None;
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn cancel_content(&self, content_id: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.content.get_mut(content_id) {
            Some(record) if record.status == ContentStatus::Scheduled => {
                record.status = ContentStatus::Canceled;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_polling_configs(&self) -> StorageResult<Vec<PollingConfig>> {
        let tables = self.tables.read().await;
        let mut configs: Vec<PollingConfig> = tables.polling.values().cloned().collect();
        configs.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(configs)
    }

    async fn get_polling_config(&self, account_id: &str) -> StorageResult<Option<PollingConfig>> {
        Ok(self.tables.read().await.polling.get(account_id).cloned())
    }

    async fn save_polling_config(&self, config: &PollingConfig) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let mut config = config.clone();
        if let Some(existing) = tables.polling.get(&config.account_id) {
            config.last_user_activity_at = config.last_user_activity_at.max(existing.last_user_activity_at);
        }
        tables.polling.insert(config.account_id.clone(), config);
        Ok(())
    }

    async fn delete_polling_config(&self, account_id: &str) -> StorageResult<bool> {
        Ok(self.tables.write().await.polling.remove(account_id).is_some())
    }

    async fn record_user_activity(&self, account_id: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.polling.get_mut(account_id) {
            Some(config) => {
                config.last_user_activity_at = config.last_user_activity_at.max(Some(at));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_snapshot_if_absent(&self, snapshot: &AnalyticsSnapshot) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        let key = (snapshot.account_id.clone(), snapshot.date);
        if tables.snapshots.contains_key(&key) {
            return Ok(false);
        }
        tables.snapshots.insert(key, snapshot.clone());
        Ok(true)
    }

    async fn get_snapshot(
        &self,
        account_id: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<AnalyticsSnapshot>> {
        Ok(self
            .tables
            .read()
            .await
            .snapshots
            .get(&(account_id.to_string(), date))
            .cloned())
    }

    async fn resolve_credential(&self, credential_ref: &str) -> StorageResult<Option<Credential>> {
        Ok(self.tables.read().await.credentials.get(credential_ref).cloned())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}
