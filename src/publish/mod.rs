//! Scheduled content publishing
//!
//! Content is written to the [`ContentStore`](crate::storage::ContentStore)
//! and a job is enqueued on a [`QueueBackend`]. Any instance may run a
//! [`PublishWorker`]; the [`FallbackScheduler`] publishes due content the
//! queue does not know about. Both go through [`ContentPublisher`], whose
//! conditional claim and commit make publishing exactly-once.

pub mod backend;
pub mod config;
pub mod error;
pub mod fallback;
pub mod job;
pub mod publisher;
pub mod queue;
pub mod redis_queue;
pub mod worker;

pub use backend::{select_backend, MemoryQueueBackend, QueueBackend};
pub use config::{FallbackConfig, PublishConfig, RedisConfig};
pub use error::{PublishError, PublishResult, QueueError, QueueResult};
pub use fallback::{FallbackScheduler, SweepReport};
pub use job::{Delivery, JobHandle, PublishJob};
pub use publisher::{ContentPublisher, PublishOutcome, PublishPath, SkipReason};
pub use queue::PublishQueue;
pub use redis_queue::RedisQueueBackend;
pub use worker::{PublishWorker, WorkResult};
