//! Durable queue backend on Redis
//!
//! Key layout (all under `key_prefix`):
//!
//! - `{prefix}:queue:jobs`: hash, content id to JSON payload
//! - `{prefix}:queue:ready`: sorted set, content id scored by ready time (ms)
//! - `{prefix}:queue:reserved`: sorted set, content id scored by visibility deadline (ms)
//! - `{prefix}:queue:deliveries`: hash, content id to delivery count
//!
//! The stored payload embeds a random receipt, so comparing the payload
//! string is enough to detect a job that was replaced while reserved.
//! Reservation, ack and nack run as Lua scripts to stay atomic across
//! workers on different instances.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::backend::QueueBackend;
use super::config::RedisConfig;
use super::error::{QueueError, QueueResult};
use super::job::{Delivery, PublishJob};

const RESERVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('ZADD', KEYS[1], now, id)
end
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
local payload = redis.call('HGET', KEYS[3], id)
if not payload then
    redis.call('HDEL', KEYS[4], id)
    return false
end
redis.call('ZADD', KEYS[2], ARGV[2], id)
local deliveries = redis.call('HINCRBY', KEYS[4], id, 1)
return {payload, deliveries}
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
return 1
"#;

const NACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

#[derive(Debug, Serialize, Deserialize)]
struct StoredJob {
    receipt: String,
    job: PublishJob,
}

/// Queue backend stored in Redis
pub struct RedisQueueBackend {
    pool: Pool,
    key_prefix: String,
}

impl RedisQueueBackend {
    /// Build the pool and verify the server answers `PING`
    pub async fn connect(config: &RedisConfig) -> QueueResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| QueueError::Unavailable(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size.max(1))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| QueueError::Unavailable(format!("Failed to create Redis pool: {e}")))?;

        let backend = Self {
            pool,
            key_prefix: config.key_prefix.clone(),
        };
        backend.ping().await?;
        Ok(backend)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    fn key(&self, name: &str) -> String {
        format!("{}:queue:{}", self.key_prefix, name)
    }

    fn millis(at: DateTime<Utc>) -> i64 {
        at.timestamp_millis()
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn enqueue(&self, job: &PublishJob, ready_at: DateTime<Utc>) -> QueueResult<()> {
        let payload = serde_json::to_string(&StoredJob {
            receipt: Uuid::new_v4().to_string(),
            job: job.clone(),
        })?;

        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset(self.key("jobs"), &job.content_id, payload)
            .ignore()
            .hdel(self.key("deliveries"), &job.content_id)
            .ignore()
            .zrem(self.key("reserved"), &job.content_id)
            .ignore()
            .zadd(self.key("ready"), &job.content_id, Self::millis(ready_at))
            .ignore()
            .query_async(&mut *conn)
            .await?;

        debug!(content_id = %job.content_id, ready_at = %ready_at, "Job enqueued in Redis");
        Ok(())
    }

    async fn cancel(&self, content_id: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let (removed,): (u32,) = redis::pipe()
            .atomic()
            .hdel(self.key("jobs"), content_id)
            .hdel(self.key("deliveries"), content_id)
            .ignore()
            .zrem(self.key("ready"), content_id)
            .ignore()
            .zrem(self.key("reserved"), content_id)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn has_job(&self, content_id: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let exists: bool = redis::cmd("HEXISTS")
            .arg(self.key("jobs"))
            .arg(content_id)
            .query_async(&mut *conn)
            .await?;
        Ok(exists)
    }

    async fn reserve(&self, now: DateTime<Utc>, visibility: Duration) -> QueueResult<Option<Delivery>> {
        let mut conn = self.pool.get().await?;
        let reserved: Option<(String, u32)> = redis::Script::new(RESERVE_SCRIPT)
            .key(self.key("ready"))
            .key(self.key("reserved"))
            .key(self.key("jobs"))
            .key(self.key("deliveries"))
            .arg(Self::millis(now))
            .arg(Self::millis(now + visibility))
            .invoke_async(&mut *conn)
            .await?;

        let Some((payload, deliveries)) = reserved else {
            return Ok(None);
        };

        let stored: StoredJob = serde_json::from_str(&payload)?;
        Ok(Some(Delivery {
            job: stored.job,
            deliveries,
            receipt: payload,
        }))
    }

    async fn ack(&self, content_id: &str, receipt: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let acked: i32 = redis::Script::new(ACK_SCRIPT)
            .key(self.key("jobs"))
            .key(self.key("ready"))
            .key(self.key("reserved"))
            .key(self.key("deliveries"))
            .arg(content_id)
            .arg(receipt)
            .invoke_async(&mut *conn)
            .await?;
        Ok(acked == 1)
    }

    async fn nack(&self, content_id: &str, receipt: &str, ready_at: DateTime<Utc>) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let requeued: i32 = redis::Script::new(NACK_SCRIPT)
            .key(self.key("jobs"))
            .key(self.key("ready"))
            .key(self.key("reserved"))
            .arg(content_id)
            .arg(receipt)
            .arg(Self::millis(ready_at))
            .invoke_async(&mut *conn)
            .await?;
        Ok(requeued == 1)
    }

    async fn len(&self) -> QueueResult<usize> {
        let mut conn = self.pool.get().await?;
        let count: usize = redis::cmd("HLEN")
            .arg(self.key("jobs"))
            .query_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn is_reachable(&self) -> bool {
        self.ping().await.is_ok()
    }
}
