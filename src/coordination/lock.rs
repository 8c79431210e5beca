//! Distributed lock coordinator
//!
//! Wraps a [`LeaseStore`] with per-lease renewal tasks. A successful
//! [`LockCoordinator::acquire`] spawns a background task that renews the
//! lease well before it expires. Ownership is published on a watch channel
//! so that the elector can step down the moment a lease is lost.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{CoordinationError, CoordinationResult};
use super::store::LeaseStore;
use crate::clock::{to_chrono, SharedClock};
use crate::metrics;

/// Ownership state of a lease held by this coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Owned until `expires_at` unless renewed
    Held { expires_at: DateTime<Utc> },
    /// Renewal found another owner, or the store stayed unreachable past expiry
    Lost,
    /// Released explicitly
    Released,
}

impl LeaseStatus {
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }
}

struct HeldLease {
    status: Arc<watch::Sender<LeaseStatus>>,
    renewal: JoinHandle<()>,
}

/// Everything a renewal task needs, detached from the coordinator
struct RenewalTask {
    store: Arc<dyn LeaseStore>,
    clock: SharedClock,
    name: String,
    owner_id: String,
    ttl: Duration,
    fixed_interval: Option<Duration>,
    status: Arc<watch::Sender<LeaseStatus>>,
    expires_at: DateTime<Utc>,
}

impl RenewalTask {
    async fn run(mut self) {
        loop {
            tokio::time::sleep(renewal_delay(self.ttl, self.fixed_interval)).await;

            let now = self.clock.now();
            match self
                .store
                .renew(&self.name, &self.owner_id, to_chrono(self.ttl), now)
                .await
            {
                Ok(Some(lease)) => {
                    self.expires_at = lease.expires_at;
                    self.status.send_replace(LeaseStatus::Held {
                        expires_at: lease.expires_at,
                    });
                    metrics::record_lease_event(&self.name, "renewed");
                    debug!(lease = %self.name, expires_at = %lease.expires_at, "Lease renewed");
                }
                Ok(None) => {
                    warn!(lease = %self.name, "Lease renewal matched no row, ownership lost");
                    self.lose();
                    return;
                }
                Err(e) if self.clock.now() > self.expires_at => {
                    warn!(lease = %self.name, error = %e, "Lease expired while store was failing");
                    self.lose();
                    return;
                }
                Err(e) => {
                    warn!(
                        lease = %self.name,
                        error = %e,
                        expires_at = %self.expires_at,
                        "Lease renewal failed, retrying before expiry"
                    );
                }
            }
        }
    }

    fn lose(&self) {
        self.status.send_replace(LeaseStatus::Lost);
        metrics::record_lease_event(&self.name, "lost");
    }
}

/// Delay before the next renewal attempt
///
/// A fixed interval wins when configured; otherwise a random point between
/// ttl/2.5 and ttl/2 so that instances do not renew in lockstep.
fn renewal_delay(ttl: Duration, fixed: Option<Duration>) -> Duration {
    if let Some(fixed) = fixed {
        return fixed;
    }

    let upper = ttl.as_secs_f64() / 2.0;
    let lower = ttl.as_secs_f64() / 2.5;
    if upper <= lower {
        return Duration::from_secs_f64(upper);
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(lower..=upper))
}

/// Named-lease coordinator for one owner
pub struct LockCoordinator {
    store: Arc<dyn LeaseStore>,
    owner_id: String,
    clock: SharedClock,
    renewal_interval: Option<Duration>,
    held: Mutex<HashMap<String, HeldLease>>,
}

impl LockCoordinator {
    /// Create a coordinator acting as `owner_id`
    pub fn new(store: Arc<dyn LeaseStore>, owner_id: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            clock,
            renewal_interval: None,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Use a fixed renewal interval instead of the jittered default
    pub fn with_renewal_interval(mut self, interval: Option<Duration>) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Try to take `name` for `ttl`
    ///
    /// Returns `Ok(false)` when another owner holds a live lease. Store
    /// failures come back as `Err` and never as `Ok(false)`.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> CoordinationResult<bool> {
        if ttl.is_zero() {
            return Err(CoordinationError::InvalidConfig(
                "lease ttl must be greater than 0".to_string(),
            ));
        }

        let now = self.clock.now();
        match self
            .store
            .try_acquire(name, &self.owner_id, to_chrono(ttl), now)
            .await
        {
            Ok(Some(lease)) => {
                self.start_renewal(name, ttl, lease.expires_at);
                metrics::record_lease_event(name, "acquired");
                info!(
                    lease = %name,
                    owner = %self.owner_id,
                    expires_at = %lease.expires_at,
                    "Lease acquired"
                );
                Ok(true)
            }
            Ok(None) => {
                metrics::record_lease_event(name, "rejected");
                debug!(lease = %name, "Lease held by another owner");
                Ok(false)
            }
            Err(e) => {
                metrics::record_lease_event(name, "error");
                warn!(lease = %name, error = %e, "Lease acquisition failed");
                Err(e)
            }
        }
    }

    /// Renew `name` immediately
    ///
    /// `Ok(false)` means ownership is gone; the renewal task is stopped and
    /// the caller must not keep acting as owner.
    pub async fn renew(&self, name: &str, ttl: Duration) -> CoordinationResult<bool> {
        let now = self.clock.now();
        match self
            .store
            .renew(name, &self.owner_id, to_chrono(ttl), now)
            .await?
        {
            Some(lease) => {
                if let Some(held) = self.lock_held().get(name) {
                    held.status.send_replace(LeaseStatus::Held {
                        expires_at: lease.expires_at,
                    });
                }
                metrics::record_lease_event(name, "renewed");
                Ok(true)
            }
            None => {
                self.forget(name, LeaseStatus::Lost);
                metrics::record_lease_event(name, "lost");
                warn!(lease = %name, "Lease renewal rejected, ownership lost");
                Ok(false)
            }
        }
    }

    /// Stop renewing and delete the lease row if still owned
    pub async fn release(&self, name: &str) -> CoordinationResult<bool> {
        self.forget(name, LeaseStatus::Released);
        let released = self.store.release(name, &self.owner_id).await?;
        if released {
            metrics::record_lease_event(name, "released");
            info!(lease = %name, "Lease released");
        }
        Ok(released)
    }

    /// Release every lease this coordinator holds
    ///
    /// All releases are attempted; the first error is returned.
    pub async fn release_all(&self) -> CoordinationResult<()> {
        let names: Vec<String> = self.lock_held().keys().cloned().collect();
        let mut first_error = None;

        for name in names {
            if let Err(e) = self.release(&name).await {
                warn!(lease = %name, error = %e, "Failed to release lease");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete expired lease rows from the store
    pub async fn cleanup_expired(&self) -> CoordinationResult<u64> {
        let removed = self.store.delete_expired(self.clock.now()).await?;
        if removed > 0 {
            info!(removed, "Expired leases cleaned up");
        }
        Ok(removed)
    }

    /// Whether this coordinator currently believes it owns `name`
    pub fn is_held(&self, name: &str) -> bool {
        let now = self.clock.now();
        self.lock_held().get(name).is_some_and(|held| {
            matches!(*held.status.borrow(), LeaseStatus::Held { expires_at } if expires_at >= now)
        })
    }

    /// Subscribe to ownership changes of a lease acquired by this coordinator
    pub fn watch(&self, name: &str) -> Option<watch::Receiver<LeaseStatus>> {
        self.lock_held().get(name).map(|held| held.status.subscribe())
    }

    /// Names of leases currently held
    pub fn held_leases(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut names: Vec<String> = self
            .lock_held()
            .iter()
            .filter(|(_, held)| {
                matches!(*held.status.borrow(), LeaseStatus::Held { expires_at } if expires_at >= now)
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn start_renewal(&self, name: &str, ttl: Duration, expires_at: DateTime<Utc>) {
        let mut held = self.lock_held();

        let status = match held.remove(name) {
            Some(previous) => {
                previous.renewal.abort();
                previous.status.send_replace(LeaseStatus::Held { expires_at });
                previous.status
            }
            None => Arc::new(watch::channel(LeaseStatus::Held { expires_at }).0),
        };

        let task = RenewalTask {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            name: name.to_string(),
            owner_id: self.owner_id.clone(),
            ttl,
            fixed_interval: self.renewal_interval,
            status: Arc::clone(&status),
            expires_at,
        };

        let renewal = tokio::spawn(task.run());
        held.insert(name.to_string(), HeldLease { status, renewal });
    }

    fn forget(&self, name: &str, final_status: LeaseStatus) {
        if let Some(held) = self.lock_held().remove(name) {
            held.renewal.abort();
            held.status.send_replace(final_status);
        }
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, HashMap<String, HeldLease>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for LockCoordinator {
    /// Renewal stops with the coordinator; rows stay until they expire
    fn drop(&mut self) {
        for (_, held) in self.lock_held().drain() {
            held.renewal.abort();
        }
    }
}
