//! Change notifications for external subscribers
//!
//! The polling loop emits one [`AccountEvent`] per detected change. The
//! default broadcaster fans events out over a tokio broadcast channel;
//! other transports (websocket gateways, webhooks) implement
//! [`EventBroadcaster`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::AccountStats;

// ============================================================================
// Events
// ============================================================================

/// Events pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountEvent {
    /// Account stats changed since the last poll
    StatsChanged {
        account_id: String,
        workspace_id: String,
        previous: Option<AccountStats>,
        current: AccountStats,
        observed_at: DateTime<Utc>,
    },
}

impl AccountEvent {
    pub fn account_id(&self) -> &str {
        match self {
            Self::StatsChanged { account_id, .. } => account_id,
        }
    }
}

// ============================================================================
// Broadcasting
// ============================================================================

/// Push notifications to subscribers
pub trait EventBroadcaster: Send + Sync {
    /// Publish an event; returns how many subscribers received it
    fn broadcast(&self, event: AccountEvent) -> usize;
}

/// In-process broadcaster over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    event_tx: broadcast::Sender<AccountEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    /// Subscribe to account events
    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: AccountEvent) -> usize {
        match self.event_tx.send(event) {
            Ok(count) => count,
            Err(_) => {
                tracing::debug!("No event subscribers connected");
                0
            }
        }
    }
}
