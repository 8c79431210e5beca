//! Registry of monitored accounts
//!
//! Holds the in-memory polling state for every account the leader polls.
//! Only the leader writes here, so a process-local mutex is enough; the
//! durable copy lives in the content store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::PollingConfig;

/// Where an account's loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoopState {
    /// Registered, loop not yet started
    Idle,
    /// Waiting for the next tick
    Scheduled { next_tick_at: DateTime<Utc> },
    /// Tick in flight
    Polling,
    /// Loop stopped (account deactivated or leadership lost)
    Stopped,
}

#[derive(Debug, Clone)]
struct AccountEntry {
    config: PollingConfig,
    state: LoopState,
    /// A tick for this account is running
    in_flight: bool,
}

/// Point-in-time view of one account
#[derive(Debug, Clone, Serialize)]
pub struct AccountView {
    pub account_id: String,
    pub state: LoopState,
    pub consecutive_no_change_count: u32,
    pub last_polled_at: Option<DateTime<Utc>>,
}

/// Per-account polling state owned by the leader
#[derive(Debug, Default)]
pub struct PollingRegistry {
    accounts: Mutex<HashMap<String, AccountEntry>>,
}

impl PollingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AccountEntry>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an account, or replace its config if already present
    ///
    /// Returns `true` when the account was not registered before.
    pub fn upsert(&self, config: PollingConfig) -> bool {
        let mut accounts = self.lock();
        match accounts.get_mut(&config.account_id) {
            Some(entry) => {
                entry.config = config;
                false
            }
            None => {
                accounts.insert(
                    config.account_id.clone(),
                    AccountEntry {
                        config,
                        state: LoopState::Idle,
                        in_flight: false,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, account_id: &str) -> Option<PollingConfig> {
        self.lock().get(account_id).map(|e| e.config.clone())
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.lock().contains_key(account_id)
    }

    /// Mutate an account's config in place and return the result
    pub fn update<F>(&self, account_id: &str, f: F) -> Option<PollingConfig>
    where
        F: FnOnce(&mut PollingConfig),
    {
        let mut accounts = self.lock();
        accounts.get_mut(account_id).map(|entry| {
            f(&mut entry.config);
            entry.config.clone()
        })
    }

    pub fn set_state(&self, account_id: &str, state: LoopState) {
        if let Some(entry) = self.lock().get_mut(account_id) {
            entry.state = state;
        }
    }

    /// Mark a tick as started for an account
    ///
    /// Returns `Some(false)` when another tick already holds the account
    /// and `None` when the account is not registered.
    pub fn try_begin_tick(&self, account_id: &str) -> Option<bool> {
        self.lock().get_mut(account_id).map(|entry| {
            if entry.in_flight {
                false
            } else {
                entry.in_flight = true;
                true
            }
        })
    }

    pub fn end_tick(&self, account_id: &str) {
        if let Some(entry) = self.lock().get_mut(account_id) {
            entry.in_flight = false;
        }
    }

    pub fn state(&self, account_id: &str) -> Option<LoopState> {
        self.lock().get(account_id).map(|e| e.state)
    }

    /// Drop an account from the registry
    pub fn remove(&self, account_id: &str) -> Option<PollingConfig> {
        self.lock().remove(account_id).map(|e| e.config)
    }

    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Views of all accounts, sorted by id
    pub fn views(&self) -> Vec<AccountView> {
        let mut views: Vec<AccountView> = self
            .lock()
            .iter()
            .map(|(id, entry)| AccountView {
                account_id: id.clone(),
                state: entry.state,
                consecutive_no_change_count: entry.config.consecutive_no_change_count,
                last_polled_at: entry.config.last_polled_at,
            })
            .collect();
        views.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_update() {
        let registry = PollingRegistry::new();
        assert!(registry.upsert(PollingConfig::new("a", "ws", "cred")));
        assert!(!registry.upsert(PollingConfig::new("a", "ws", "cred-2")));
        assert_eq!(registry.get("a").unwrap().credential_ref, "cred-2");

        let updated = registry
            .update("a", |c| c.consecutive_no_change_count = 4)
            .unwrap();
        assert_eq!(updated.consecutive_no_change_count, 4);
        assert!(registry.update("missing", |_| {}).is_none());
    }

    #[test]
    fn test_state_tracking() {
        let registry = PollingRegistry::new();
        registry.upsert(PollingConfig::new("a", "ws", "cred"));
        assert_eq!(registry.state("a"), Some(LoopState::Idle));

        registry.set_state("a", LoopState::Polling);
        assert_eq!(registry.state("a"), Some(LoopState::Polling));

        registry.remove("a");
        assert!(registry.state("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_one_tick_at_a_time() {
        let registry = PollingRegistry::new();
        assert_eq!(registry.try_begin_tick("a"), None);

        registry.upsert(PollingConfig::new("a", "ws", "cred"));
        assert_eq!(registry.try_begin_tick("a"), Some(true));
        assert_eq!(registry.try_begin_tick("a"), Some(false));

        // Replacing the config does not release the tick
        registry.upsert(PollingConfig::new("a", "ws", "cred-2"));
        assert_eq!(registry.try_begin_tick("a"), Some(false));

        registry.end_tick("a");
        assert_eq!(registry.try_begin_tick("a"), Some(true));
    }
}
