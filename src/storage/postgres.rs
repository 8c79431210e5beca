//! PostgreSQL content store
//!
//! Every cross-instance transition is a single conditional `UPDATE ...
//! RETURNING`, so two instances racing on the same content id cannot both
//! win a claim or both commit a publish.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use super::{AttemptFailure, ContentStore, StorageError, StorageResult, UpsertOutcome};
use crate::models::{
    AnalyticsSnapshot, ContentRecord, ContentStatus, Credential, Platform, PollingConfig,
};

const CONTENT_COLUMNS: &str = "content_id, workspace_id, account_id, platform, title, caption, \
     media_refs, scheduled_at, attempt_count, status, external_post_id, failure_reason, \
     claimed_at, published_at, updated_at";

const POLLING_COLUMNS: &str = "account_id, workspace_id, credential_ref, \
     last_known_follower_count, last_known_media_count, last_engagement_snapshot, \
     consecutive_no_change_count, last_user_activity_at, last_polled_at";

/// Content store backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresContentStore {
    pool: Pool,
}

impl PostgresContentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Initialize content, polling, snapshot and credential tables
    pub async fn init_schema(&self) -> StorageResult<()> {
        let client = self.pool.get().await?;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS scheduled_content (
                    content_id VARCHAR(128) PRIMARY KEY,
                    workspace_id VARCHAR(128) NOT NULL,
                    account_id VARCHAR(128) NOT NULL,
                    platform VARCHAR(32) NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    caption TEXT NOT NULL DEFAULT '',
                    media_refs JSONB NOT NULL DEFAULT '[]'::jsonb,
                    scheduled_at TIMESTAMPTZ NOT NULL,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    status VARCHAR(16) NOT NULL,
                    external_post_id TEXT,
                    failure_reason TEXT,
                    claimed_at TIMESTAMPTZ,
                    published_at TIMESTAMPTZ,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );

                CREATE INDEX IF NOT EXISTS idx_scheduled_content_due
                    ON scheduled_content(status, scheduled_at);

                CREATE TABLE IF NOT EXISTS polling_configs (
                    account_id VARCHAR(128) PRIMARY KEY,
                    workspace_id VARCHAR(128) NOT NULL,
                    credential_ref VARCHAR(256) NOT NULL,
                    last_known_follower_count BIGINT,
                    last_known_media_count BIGINT,
                    last_engagement_snapshot DOUBLE PRECISION,
                    consecutive_no_change_count INTEGER NOT NULL DEFAULT 0,
                    last_user_activity_at TIMESTAMPTZ,
                    last_polled_at TIMESTAMPTZ
                );

                CREATE TABLE IF NOT EXISTS analytics_snapshots (
                    account_id VARCHAR(128) NOT NULL,
                    snapshot_date DATE NOT NULL,
                    workspace_id VARCHAR(128) NOT NULL,
                    follower_count BIGINT NOT NULL,
                    media_count BIGINT NOT NULL,
                    engagement DOUBLE PRECISION NOT NULL,
                    captured_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (account_id, snapshot_date)
                );

                CREATE TABLE IF NOT EXISTS platform_credentials (
                    credential_ref VARCHAR(256) PRIMARY KEY,
                    account_id VARCHAR(128) NOT NULL,
                    access_token TEXT NOT NULL
                );
                "#,
            )
            .await
            .map_err(|e| StorageError::Setup(format!("Failed to create content schema: {e}")))?;

        tracing::info!("Content schema initialized");
        Ok(())
    }

    fn row_to_content(row: &Row) -> StorageResult<ContentRecord> {
        let platform: String = row.get("platform");
        let status: String = row.get("status");
        let media_refs: serde_json::Value = row.get("media_refs");
        let attempt_count: i32 = row.get("attempt_count");

        Ok(ContentRecord {
            content_id: row.get("content_id"),
            workspace_id: row.get("workspace_id"),
            account_id: row.get("account_id"),
            platform: Platform::parse(&platform)
                .ok_or_else(|| StorageError::corrupt("scheduled_content", format!("platform '{platform}'")))?,
            title: row.get("title"),
            caption: row.get("caption"),
            media_refs: serde_json::from_value(media_refs)
                .map_err(|e| StorageError::corrupt("scheduled_content", e.to_string()))?,
            scheduled_at: row.get("scheduled_at"),
            attempt_count: attempt_count.max(0) as u32,
            status: ContentStatus::parse(&status)
                .ok_or_else(|| StorageError::corrupt("scheduled_content", format!("status '{status}'")))?,
            external_post_id: row.get("external_post_id"),
            failure_reason: row.get("failure_reason"),
            claimed_at: row.get("claimed_at"),
            published_at: row.get("published_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_polling(row: &Row) -> PollingConfig {
        let followers: Option<i64> = row.get("last_known_follower_count");
        let media: Option<i64> = row.get("last_known_media_count");
        let no_change: i32 = row.get("consecutive_no_change_count");

        PollingConfig {
            account_id: row.get("account_id"),
            workspace_id: row.get("workspace_id"),
            credential_ref: row.get("credential_ref"),
            last_known_follower_count: followers.map(|v| v.max(0) as u64),
            last_known_media_count: media.map(|v| v.max(0) as u64),
            last_engagement_snapshot: row.get("last_engagement_snapshot"),
            consecutive_no_change_count: no_change.max(0) as u32,
            last_user_activity_at: row.get("last_user_activity_at"),
            last_polled_at: row.get("last_polled_at"),
        }
    }

    fn row_to_snapshot(row: &Row) -> AnalyticsSnapshot {
        let followers: i64 = row.get("follower_count");
        let media: i64 = row.get("media_count");

        AnalyticsSnapshot {
            account_id: row.get("account_id"),
            workspace_id: row.get("workspace_id"),
            date: row.get("snapshot_date"),
            follower_count: followers.max(0) as u64,
            media_count: media.max(0) as u64,
            engagement: row.get("engagement"),
            captured_at: row.get("captured_at"),
        }
    }

    fn clamp_i64(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    fn clamp_i32(value: u32) -> i32 {
        i32::try_from(value).unwrap_or(i32::MAX)
    }
}

#[async_trait]
impl ContentStore for PostgresContentStore {
    async fn upsert_content(&self, record: &ContentRecord) -> StorageResult<UpsertOutcome> {
        let client = self.pool.get().await?;
        let media_refs = serde_json::to_value(&record.media_refs)
            .map_err(|e| StorageError::query("upsert_content", e.to_string()))?;

        let written = client
            .execute(
                r#"
                INSERT INTO scheduled_content AS c (
                    content_id, workspace_id, account_id, platform, title, caption,
                    media_refs, scheduled_at, attempt_count, status, external_post_id,
                    failure_reason, claimed_at, published_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (content_id) DO UPDATE SET
                    workspace_id = EXCLUDED.workspace_id,
                    account_id = EXCLUDED.account_id,
                    platform = EXCLUDED.platform,
                    title = EXCLUDED.title,
                    caption = EXCLUDED.caption,
                    media_refs = EXCLUDED.media_refs,
                    scheduled_at = EXCLUDED.scheduled_at,
                    attempt_count = CASE
                        WHEN c.status = 'scheduled' THEN GREATEST(c.attempt_count, EXCLUDED.attempt_count)
                        ELSE EXCLUDED.attempt_count
                    END,
                    status = EXCLUDED.status,
                    external_post_id = EXCLUDED.external_post_id,
                    failure_reason = CASE
                        WHEN c.status = 'scheduled' THEN COALESCE(EXCLUDED.failure_reason, c.failure_reason)
                        ELSE EXCLUDED.failure_reason
                    END,
                    claimed_at = EXCLUDED.claimed_at,
                    published_at = EXCLUDED.published_at,
                    updated_at = EXCLUDED.updated_at
                WHERE c.external_post_id IS NULL AND c.status <> 'active'
                "#,
                &[
                    &record.content_id,
                    &record.workspace_id,
                    &record.account_id,
                    &record.platform.as_str(),
                    &record.title,
                    &record.caption,
                    &media_refs,
                    &record.scheduled_at,
                    &Self::clamp_i32(record.attempt_count),
                    &record.status.as_str(),
                    &record.external_post_id,
                    &record.failure_reason,
                    &record.claimed_at,
                    &record.published_at,
                    &record.updated_at,
                ],
            )
            .await?;

        if written > 0 {
            return Ok(UpsertOutcome::Stored);
        }

        // Refused; report why from the row as it stands
        Ok(self
            .get_content(&record.content_id)
            .await?
            .map_or(UpsertOutcome::InProgress, |existing| UpsertOutcome::refused(&existing)))
    }

    async fn get_content(&self, content_id: &str) -> StorageResult<Option<ContentRecord>> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {CONTENT_COLUMNS} FROM scheduled_content WHERE content_id = $1");

        client
            .query_opt(&query, &[&content_id])
            .await?
            .as_ref()
            .map(Self::row_to_content)
            .transpose()
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<ContentRecord>> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {CONTENT_COLUMNS} FROM scheduled_content \
             WHERE status = 'scheduled' AND scheduled_at <= $1 \
             ORDER BY scheduled_at, content_id LIMIT $2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        client
            .query(&query, &[&now, &limit])
            .await?
            .iter()
            .map(Self::row_to_content)
            .collect()
    }

    async fn claim_for_publish(
        &self,
        content_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StorageResult<Option<ContentRecord>> {
        let client = self.pool.get().await?;
        let stale_before = now - stale_after;
        let query = format!(
            r#"
            UPDATE scheduled_content
            SET status = 'active', claimed_at = $2, updated_at = $2
            WHERE content_id = $1
              AND external_post_id IS NULL
              AND (
                status = 'scheduled'
                OR (status = 'active' AND (claimed_at IS NULL OR claimed_at <= $3))
              )
            RETURNING {CONTENT_COLUMNS}
            "#
        );

        client
            .query_opt(&query, &[&content_id, &now, &stale_before])
            .await?
            .as_ref()
            .map(Self::row_to_content)
            .transpose()
    }

    async fn mark_published(
        &self,
        content_id: &str,
        claimed_at: DateTime<Utc>,
        external_post_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE scheduled_content
                SET status = 'published', external_post_id = $2, failure_reason = NULL,
                    published_at = $3, updated_at = $3
                WHERE content_id = $1 AND status = 'active' AND external_post_id IS NULL
                  AND claimed_at = $4
                "#,
                &[&content_id, &external_post_id, &now, &claimed_at],
            )
            .await?;

        Ok(updated > 0)
    }

    async fn record_failed_attempt(
        &self,
        content_id: &str,
        claimed_at: DateTime<Utc>,
        failure: &AttemptFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ContentRecord>> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            UPDATE scheduled_content
            SET attempt_count = attempt_count + 1,
                status = CASE
                    WHEN $2 OR attempt_count + 1 >= $3 THEN 'failed'
                    ELSE 'scheduled'
                END,
                failure_reason = $4,
                claimed_at = NULL,
                updated_at = $5
            WHERE content_id = $1 AND status = 'active' AND external_post_id IS NULL
              AND claimed_at = $6
            RETURNING {CONTENT_COLUMNS}
            "#
        );

        client
            .query_opt(
                &query,
                &[
                    &content_id,
                    &failure.permanent,
                    &Self::clamp_i32(failure.max_attempts),
                    &failure.reason,
                    &now,
                    &claimed_at,
                ],
            )
            .await?
            .as_ref()
            .map(Self::row_to_content)
            .transpose()
    }

    async fn cancel_content(&self, content_id: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE scheduled_content SET status = 'canceled', updated_at = $2 \
                 WHERE content_id = $1 AND status = 'scheduled'",
                &[&content_id, &now],
            )
            .await?;

        Ok(updated > 0)
    }

    async fn list_polling_configs(&self) -> StorageResult<Vec<PollingConfig>> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {POLLING_COLUMNS} FROM polling_configs ORDER BY account_id");
        let rows = client.query(&query, &[]).await?;
        Ok(rows.iter().map(Self::row_to_polling).collect())
    }

    async fn get_polling_config(&self, account_id: &str) -> StorageResult<Option<PollingConfig>> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {POLLING_COLUMNS} FROM polling_configs WHERE account_id = $1");
        let row = client.query_opt(&query, &[&account_id]).await?;
        Ok(row.as_ref().map(Self::row_to_polling))
    }

    async fn save_polling_config(&self, config: &PollingConfig) -> StorageResult<()> {
        let client = self.pool.get().await?;
        let query = format!(
            r#"
            INSERT INTO polling_configs ({POLLING_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (account_id) DO UPDATE SET
                workspace_id = EXCLUDED.workspace_id,
                credential_ref = EXCLUDED.credential_ref,
                last_known_follower_count = EXCLUDED.last_known_follower_count,
                last_known_media_count = EXCLUDED.last_known_media_count,
                last_engagement_snapshot = EXCLUDED.last_engagement_snapshot,
                consecutive_no_change_count = EXCLUDED.consecutive_no_change_count,
                last_user_activity_at = GREATEST(
                    polling_configs.last_user_activity_at,
                    EXCLUDED.last_user_activity_at
                ),
                last_polled_at = EXCLUDED.last_polled_at
            "#
        );

        client
            .execute(
                &query,
                &[
                    &config.account_id,
                    &config.workspace_id,
                    &config.credential_ref,
                    &config.last_known_follower_count.map(Self::clamp_i64),
                    &config.last_known_media_count.map(Self::clamp_i64),
                    &config.last_engagement_snapshot,
                    &Self::clamp_i32(config.consecutive_no_change_count),
                    &config.last_user_activity_at,
                    &config.last_polled_at,
                ],
            )
            .await?;

        Ok(())
    }

    async fn delete_polling_config(&self, account_id: &str) -> StorageResult<bool> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM polling_configs WHERE account_id = $1",
                &[&account_id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn record_user_activity(&self, account_id: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE polling_configs \
                 SET last_user_activity_at = GREATEST(last_user_activity_at, $2) \
                 WHERE account_id = $1",
                &[&account_id, &at],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn insert_snapshot_if_absent(&self, snapshot: &AnalyticsSnapshot) -> StorageResult<bool> {
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                r#"
                INSERT INTO analytics_snapshots (
                    account_id, snapshot_date, workspace_id, follower_count,
                    media_count, engagement, captured_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (account_id, snapshot_date) DO NOTHING
                "#,
                &[
                    &snapshot.account_id,
                    &snapshot.date,
                    &snapshot.workspace_id,
                    &Self::clamp_i64(snapshot.follower_count),
                    &Self::clamp_i64(snapshot.media_count),
                    &snapshot.engagement,
                    &snapshot.captured_at,
                ],
            )
            .await?;

        Ok(inserted > 0)
    }

    async fn get_snapshot(
        &self,
        account_id: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<AnalyticsSnapshot>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT account_id, snapshot_date, workspace_id, follower_count, media_count, \
                 engagement, captured_at FROM analytics_snapshots \
                 WHERE account_id = $1 AND snapshot_date = $2",
                &[&account_id, &date],
            )
            .await?;
        Ok(row.as_ref().map(Self::row_to_snapshot))
    }

    async fn resolve_credential(&self, credential_ref: &str) -> StorageResult<Option<Credential>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT account_id, access_token FROM platform_credentials WHERE credential_ref = $1",
                &[&credential_ref],
            )
            .await?;

        Ok(row.map(|row| Credential {
            account_id: row.get("account_id"),
            access_token: row.get("access_token"),
        }))
    }

    async fn ping(&self) -> StorageResult<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
