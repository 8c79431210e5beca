//! Persistence for content records, account polling state and snapshots
//!
//! [`ContentStore`] is the only way the worker, the fallback sweep and the
//! polling loop touch durable state. Status transitions that race between
//! instances (claiming content for publish, committing the result) are
//! conditional updates, so exactly one caller wins.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryContentStore;
pub use postgres::PostgresContentStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, PoolConfig as PoolSizing, RecyclingMethod, Runtime};
use serde::{Deserialize, Serialize};
use tokio_postgres::NoTls;

use crate::models::{AnalyticsSnapshot, ContentRecord, Credential, PollingConfig};

// ============================================================================
// Configuration
// ============================================================================

/// PostgreSQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub postgres_url: String,

    /// Connection pool size
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: "postgresql://localhost/cadence".to_string(),
            pool_size: 10,
        }
    }
}

/// Create a PostgreSQL connection pool
///
/// The pool is lazy; the first checkout opens a connection.
pub async fn create_pool(config: &DatabaseConfig) -> StorageResult<Pool> {
    let mut pool_config = PoolConfig::new();
    pool_config.url = Some(config.postgres_url.clone());
    pool_config.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    pool_config.pool = Some(PoolSizing::new(config.pool_size.max(1)));

    pool_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StorageError::Setup(format!("Failed to create PostgreSQL pool: {e}")))
}

// ============================================================================
// Store Contract
// ============================================================================

/// Why a publish attempt failed, and what that means for the record
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// Human-readable reason stored on the record
    pub reason: String,
    /// Retrying cannot help; fail immediately
    pub permanent: bool,
    /// Attempts allowed before the record is failed
    pub max_attempts: u32,
}

impl AttemptFailure {
    /// Status the record moves to after this failure
    pub fn is_terminal_after(&self, attempt_count: u32) -> bool {
        self.permanent || attempt_count >= self.max_attempts
    }
}

/// Result of [`ContentStore::upsert_content`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Record written
    Stored,
    /// Stored record is published; nothing written
    Published,
    /// Stored record is claimed by a publish in flight; nothing written
    InProgress,
}

impl UpsertOutcome {
    /// Classify a refused write from the stored record
    pub fn refused(existing: &ContentRecord) -> Self {
        if existing.external_post_id.is_some() {
            Self::Published
        } else {
            Self::InProgress
        }
    }
}

/// Durable state shared by every instance
#[async_trait]
pub trait ContentStore: Send + Sync {
    // --- content records ---

    /// Insert or replace a content record
    ///
    /// Refuses to write over a record that has an external post id
    /// (published records are immutable) or that is `active` (a publish is
    /// in flight). Replacing a `scheduled` record keeps its attempt count
    /// and last failure reason; `failed` and `canceled` records start over.
    async fn upsert_content(&self, record: &ContentRecord) -> StorageResult<UpsertOutcome>;

    async fn get_content(&self, content_id: &str) -> StorageResult<Option<ContentRecord>>;

    /// `scheduled` records with `scheduled_at <= now`, oldest first
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<ContentRecord>>;

    /// Move a record from `scheduled` to `active`
    ///
    /// Also reclaims an `active` record whose claim is older than
    /// `stale_after` and which has no external post id. Returns the claimed
    /// record, or `None` when someone else owns it or it is no longer
    /// publishable.
    async fn claim_for_publish(
        &self,
        content_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StorageResult<Option<ContentRecord>>;

    /// Commit a successful publish: `active` to `published` with the external id
    ///
    /// Applied at most once, and only while the claim taken at `claimed_at`
    /// is still the current one; returns `false` otherwise.
    async fn mark_published(
        &self,
        content_id: &str,
        claimed_at: DateTime<Utc>,
        external_post_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Count a failed attempt on a claimed record
    ///
    /// Increments `attempt_count`, then either fails the record (permanent
    /// error or attempts exhausted) or returns it to `scheduled`. Returns
    /// `None` when the claim taken at `claimed_at` is no longer current.
    async fn record_failed_attempt(
        &self,
        content_id: &str,
        claimed_at: DateTime<Utc>,
        failure: &AttemptFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ContentRecord>>;

    /// Cancel a record that is still `scheduled`
    async fn cancel_content(&self, content_id: &str, now: DateTime<Utc>) -> StorageResult<bool>;

    // --- account polling state ---

    async fn list_polling_configs(&self) -> StorageResult<Vec<PollingConfig>>;

    async fn get_polling_config(&self, account_id: &str) -> StorageResult<Option<PollingConfig>>;

    async fn save_polling_config(&self, config: &PollingConfig) -> StorageResult<()>;

    async fn delete_polling_config(&self, account_id: &str) -> StorageResult<bool>;

    /// Move `last_user_activity_at` forward without touching other fields
    ///
    /// Any instance may call this; the leader picks it up on its next tick.
    async fn record_user_activity(&self, account_id: &str, at: DateTime<Utc>) -> StorageResult<bool>;

    // --- analytics snapshots ---

    /// Insert the day's snapshot unless one exists; returns whether it was written
    async fn insert_snapshot_if_absent(&self, snapshot: &AnalyticsSnapshot) -> StorageResult<bool>;

    async fn get_snapshot(
        &self,
        account_id: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<AnalyticsSnapshot>>;

    // --- credentials ---

    async fn resolve_credential(&self, credential_ref: &str) -> StorageResult<Option<Credential>>;

    /// Reachability probe
    async fn ping(&self) -> StorageResult<()>;
}
