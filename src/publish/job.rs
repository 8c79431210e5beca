//! Queue job payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{ContentRecord, Platform};

/// Payload of a scheduled publish job
///
/// Carries enough to log and route the job; the worker always reloads the
/// content record before acting on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishJob {
    pub content_id: String,
    pub workspace_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub platform: Platform,
    pub title: String,
    pub attempt_count: u32,
}

impl PublishJob {
    pub fn from_record(record: &ContentRecord) -> Self {
        Self {
            content_id: record.content_id.clone(),
            workspace_id: record.workspace_id.clone(),
            scheduled_at: record.scheduled_at,
            platform: record.platform,
            title: record.title.clone(),
            attempt_count: record.attempt_count,
        }
    }
}

/// A job handed to a worker
///
/// `receipt` identifies this particular enqueue of the job. Acks and nacks
/// carrying a stale receipt (the job was re-scheduled or canceled in the
/// meantime) are ignored.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: PublishJob,
    /// How many times this enqueue has been handed out, starting at 1
    pub deliveries: u32,
    pub receipt: String,
}

/// Returned by [`PublishQueue::schedule`](super::PublishQueue::schedule)
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub content_id: String,
    pub ready_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    /// Whether the job reached the queue; if not, the fallback sweep picks it up
    pub queued: bool,
    pub backend: &'static str,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}
