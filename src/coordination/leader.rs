//! Leader election over two leases
//!
//! An instance is leader only while it holds both the poll lease and the
//! monitor lease. Followers retry election on a fixed cadence, so a crashed
//! leader is replaced at most `lease_ttl + election_retry` after it stopped
//! renewing. There is no push hand-off.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::config::{CoordinationConfig, FailurePolicy};
use super::lock::{LeaseStatus, LockCoordinator};
use crate::metrics;

/// Role of this instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of acquiring one of the two leases
#[derive(Debug)]
enum LeaseAttempt {
    Acquired,
    HeldByOther,
    StoreError,
}

/// Decides and tracks whether this instance is the active poller
pub struct LeaderElector {
    locks: Arc<LockCoordinator>,
    config: CoordinationConfig,
    role: watch::Sender<Role>,
    /// Leader by fail-open policy without actually holding the leases
    degraded: AtomicBool,
}

impl LeaderElector {
    pub fn new(locks: Arc<LockCoordinator>, config: CoordinationConfig) -> Self {
        let (role, _) = watch::channel(Role::Follower);
        Self {
            locks,
            config,
            role,
            degraded: AtomicBool::new(false),
        }
    }

    /// Current role
    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    /// Subscribe to role changes
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    /// Whether leadership was assumed under the fail-open policy
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Run one election attempt
    ///
    /// Probes the store first and waits `health_probe_delay` if the probe
    /// fails. Then acquires the poll lease and the monitor lease. Both must
    /// succeed for leadership; if either is held by another owner any
    /// partially acquired lease is released so two candidates cannot
    /// deadlock holding one lease each. Store errors resolve through the
    /// configured [`FailurePolicy`].
    pub async fn elect(&self) -> Role {
        if let Err(e) = self.locks.store().ping().await {
            warn!(
                error = %e,
                delay_secs = self.config.health_probe_delay_secs,
                "Lease store health probe failed, delaying election"
            );
            tokio::time::sleep(self.config.health_probe_delay()).await;
        }

        let poll = self.attempt(&self.config.poll_lease_name).await;
        let monitor = match poll {
            LeaseAttempt::HeldByOther => LeaseAttempt::HeldByOther,
            _ => self.attempt(&self.config.monitor_lease_name).await,
        };

        let role = match (&poll, &monitor) {
            (LeaseAttempt::Acquired, LeaseAttempt::Acquired) => {
                self.degraded.store(false, Ordering::SeqCst);
                Role::Leader
            }
            (LeaseAttempt::HeldByOther, _) | (_, LeaseAttempt::HeldByOther) => {
                self.release_leases().await;
                self.degraded.store(false, Ordering::SeqCst);
                debug!("Leases held by another instance, remaining follower");
                Role::Follower
            }
            _ => {
                self.release_leases().await;
                self.on_store_failure()
            }
        };

        self.set_role(role);
        role
    }

    /// Give up leadership and release both leases
    pub async fn resign(&self) {
        self.release_leases().await;
        self.degraded.store(false, Ordering::SeqCst);
        self.set_role(Role::Follower);
    }

    /// Election loop
    ///
    /// Followers (and fail-open leaders without real leases) re-elect every
    /// `election_retry`. A leader watches both leases and steps down as soon
    /// as either is lost; while leading it also sweeps expired lease rows.
    /// Resigns on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance_id = %self.locks.owner_id(),
            policy = %self.config.failure_policy,
            "Leader election loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.role().is_leader() || self.is_degraded() {
                self.elect().await;
            }

            let retry = tokio::time::sleep(self.config.election_retry());

            if self.role().is_leader() && !self.is_degraded() {
                let poll = self.locks.watch(&self.config.poll_lease_name);
                let monitor = self.locks.watch(&self.config.monitor_lease_name);

                let (Some(poll), Some(monitor)) = (poll, monitor) else {
                    warn!("Leader is missing a lease handle, stepping down");
                    self.resign().await;
                    continue;
                };

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = wait_for_loss(poll) => {
                        warn!(lease = %self.config.poll_lease_name, "Poll lease lost, stepping down");
                        self.resign().await;
                    }
                    _ = wait_for_loss(monitor) => {
                        warn!(lease = %self.config.monitor_lease_name, "Monitor lease lost, stepping down");
                        self.resign().await;
                    }
                    _ = retry => {
                        if let Err(e) = self.locks.cleanup_expired().await {
                            warn!(error = %e, "Expired lease cleanup failed");
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = retry => {}
                }
            }
        }

        self.resign().await;
        info!("Leader election loop stopped");
    }

    async fn attempt(&self, name: &str) -> LeaseAttempt {
        match self.locks.acquire(name, self.config.lease_ttl()).await {
            Ok(true) => LeaseAttempt::Acquired,
            Ok(false) => LeaseAttempt::HeldByOther,
            Err(e) => {
                warn!(lease = %name, error = %e, "Lease store error during election");
                LeaseAttempt::StoreError
            }
        }
    }

    fn on_store_failure(&self) -> Role {
        match self.config.failure_policy {
            FailurePolicy::FailClosed => {
                self.degraded.store(false, Ordering::SeqCst);
                warn!("Lease store unavailable, remaining follower (fail-closed)");
                Role::Follower
            }
            FailurePolicy::FailOpen => {
                self.degraded.store(true, Ordering::SeqCst);
                error!("Lease store unavailable, assuming leadership without leases (fail-open)");
                Role::Leader
            }
        }
    }

    async fn release_leases(&self) {
        for name in [&self.config.poll_lease_name, &self.config.monitor_lease_name] {
            if !self.locks.is_held(name) && self.locks.watch(name).is_none() {
                continue;
            }
            if let Err(e) = self.locks.release(name).await {
                warn!(lease = %name, error = %e, "Failed to release lease");
            }
        }
    }

    fn set_role(&self, role: Role) {
        let previous = self.role.send_replace(role);
        metrics::set_leader(role.is_leader());
        if previous != role {
            info!(from = %previous, to = %role, degraded = self.is_degraded(), "Role changed");
        }
    }
}

/// Resolves once the lease is no longer held (or its sender is gone)
async fn wait_for_loss(mut status: watch::Receiver<LeaseStatus>) {
    let _ = status.wait_for(|s| !s.is_held()).await;
}
