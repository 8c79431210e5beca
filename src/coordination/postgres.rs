//! PostgreSQL lease store
//!
//! One row per lease name. Acquisition is a single
//! `INSERT ... ON CONFLICT DO UPDATE ... WHERE` statement, so the
//! "free, expired, or already mine" decision is made atomically by the
//! database. Expiry is computed from the database clock; the caller's
//! `now` is ignored so that skewed instance clocks cannot both believe
//! they own a lease.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use super::error::{CoordinationError, CoordinationResult};
use super::store::{Lease, LeaseStore};

const LEASE_COLUMNS: &str = "name, owner_id, acquired_at, expires_at, renewed_at";

/// Lease store backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: Pool,
}

impl PostgresLeaseStore {
    /// Create a store on an existing connection pool
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Initialize the lease table
    pub async fn init_schema(&self) -> CoordinationResult<()> {
        let client = self.pool.get().await?;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS coordination_leases (
                    name VARCHAR(128) PRIMARY KEY,
                    owner_id VARCHAR(128) NOT NULL,
                    acquired_at TIMESTAMPTZ NOT NULL,
                    expires_at TIMESTAMPTZ NOT NULL,
                    renewed_at TIMESTAMPTZ NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_coordination_leases_expires_at
                    ON coordination_leases(expires_at);
                "#,
            )
            .await
            .map_err(|e| CoordinationError::query("init_schema", e.to_string()))?;

        tracing::info!("Lease schema initialized");
        Ok(())
    }

    fn row_to_lease(row: &Row) -> Lease {
        Lease {
            name: row.get("name"),
            owner_id: row.get("owner_id"),
            acquired_at: row.get("acquired_at"),
            expires_at: row.get("expires_at"),
            renewed_at: row.get("renewed_at"),
        }
    }

    fn ttl_secs(ttl: Duration) -> f64 {
        ttl.num_milliseconds() as f64 / 1000.0
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner_id: &str,
        ttl: Duration,
        _now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>> {
        let client = self.pool.get().await?;

        let query = format!(
            r#"
            INSERT INTO coordination_leases AS l ({LEASE_COLUMNS})
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3), NOW())
            ON CONFLICT (name) DO UPDATE
            SET owner_id = EXCLUDED.owner_id,
                acquired_at = CASE
                    WHEN l.owner_id = EXCLUDED.owner_id THEN l.acquired_at
                    ELSE EXCLUDED.acquired_at
                END,
                expires_at = CASE
                    WHEN l.owner_id = EXCLUDED.owner_id
                        THEN GREATEST(l.expires_at, EXCLUDED.expires_at)
                    ELSE EXCLUDED.expires_at
                END,
                renewed_at = EXCLUDED.renewed_at
            WHERE l.expires_at < NOW() OR l.owner_id = EXCLUDED.owner_id
            RETURNING {LEASE_COLUMNS}
            "#
        );

        let row = client
            .query_opt(&query, &[&name, &owner_id, &Self::ttl_secs(ttl)])
            .await?;

        Ok(row.as_ref().map(Self::row_to_lease))
    }

    async fn renew(
        &self,
        name: &str,
        owner_id: &str,
        ttl: Duration,
        _now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>> {
        let client = self.pool.get().await?;

        let query = format!(
            r#"
            UPDATE coordination_leases
            SET expires_at = GREATEST(expires_at, NOW() + make_interval(secs => $3)),
                renewed_at = NOW()
            WHERE name = $1 AND owner_id = $2 AND expires_at >= NOW()
            RETURNING {LEASE_COLUMNS}
            "#
        );

        let row = client
            .query_opt(&query, &[&name, &owner_id, &Self::ttl_secs(ttl)])
            .await?;

        Ok(row.as_ref().map(Self::row_to_lease))
    }

    async fn release(&self, name: &str, owner_id: &str) -> CoordinationResult<bool> {
        let client = self.pool.get().await?;

        let deleted = client
            .execute(
                "DELETE FROM coordination_leases WHERE name = $1 AND owner_id = $2",
                &[&name, &owner_id],
            )
            .await?;

        Ok(deleted > 0)
    }

    async fn delete_expired(&self, _now: DateTime<Utc>) -> CoordinationResult<u64> {
        let client = self.pool.get().await?;

        let deleted = client
            .execute(
                "DELETE FROM coordination_leases WHERE expires_at < NOW()",
                &[],
            )
            .await?;

        Ok(deleted)
    }

    async fn get(&self, name: &str) -> CoordinationResult<Option<Lease>> {
        let client = self.pool.get().await?;

        let query = format!("SELECT {LEASE_COLUMNS} FROM coordination_leases WHERE name = $1");
        let row = client.query_opt(&query, &[&name]).await?;

        Ok(row.as_ref().map(Self::row_to_lease))
    }

    async fn ping(&self) -> CoordinationResult<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
