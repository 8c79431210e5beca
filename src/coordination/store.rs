//! Lease persistence
//!
//! [`LeaseStore`] is the seam between the lock coordinator and whatever
//! shared store backs it. Every method is a single atomic operation on one
//! lease row.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::error::{CoordinationError, CoordinationResult};

/// Persisted lease row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease is still live at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Atomic lease operations on a shared store
///
/// `now` is the caller's view of time. Stores with an authoritative clock
/// of their own (a database server) may use that instead so that instance
/// clock skew cannot split ownership.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Conditionally take the lease
    ///
    /// Succeeds when no row exists, the row has expired, or `owner_id`
    /// already owns it. Returns `None` when another owner holds a live
    /// lease.
    async fn try_acquire(
        &self,
        name: &str,
        owner_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>>;

    /// Extend a live lease owned by `owner_id`
    ///
    /// Returns `None` when the caller no longer owns a live lease.
    async fn renew(
        &self,
        name: &str,
        owner_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>>;

    /// Delete the lease if owned by `owner_id`
    async fn release(&self, name: &str, owner_id: &str) -> CoordinationResult<bool>;

    /// Delete every expired lease row, returning how many were removed
    async fn delete_expired(&self, now: DateTime<Utc>) -> CoordinationResult<u64>;

    /// Read a lease row
    async fn get(&self, name: &str) -> CoordinationResult<Option<Lease>>;

    /// Cheap reachability probe
    async fn ping(&self) -> CoordinationResult<()>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Process-local lease store
///
/// Shared between coordinators in the same process (tests, single-node
/// deployments). Can be switched offline to exercise store-failure paths.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
    offline: AtomicBool,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> CoordinationResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CoordinationError::StoreUnavailable(
                "memory lease store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>> {
        self.ensure_online()?;
        let mut leases = self.leases.lock().await;

        let lease = match leases.get(name) {
            Some(existing) if existing.is_owned_by(owner_id) => Lease {
                expires_at: existing.expires_at.max(now + ttl),
                renewed_at: now,
                ..existing.clone()
            },
            Some(existing) if existing.expires_at >= now => return Ok(None),
            _ => Lease {
                name: name.to_string(),
                owner_id: owner_id.to_string(),
                acquired_at: now,
                expires_at: now + ttl,
                renewed_at: now,
            },
        };

        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(
        &self,
        name: &str,
        owner_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Option<Lease>> {
        self.ensure_online()?;
        let mut leases = self.leases.lock().await;

        match leases.get_mut(name) {
            Some(lease) if lease.is_owned_by(owner_id) && lease.is_live(now) => {
                lease.expires_at = lease.expires_at.max(now + ttl);
                lease.renewed_at = now;
                Ok(Some(lease.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, name: &str, owner_id: &str) -> CoordinationResult<bool> {
        self.ensure_online()?;
        let mut leases = self.leases.lock().await;

        match leases.get(name) {
            Some(lease) if lease.is_owned_by(owner_id) => {
                leases.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> CoordinationResult<u64> {
        self.ensure_online()?;
        let mut leases = self.leases.lock().await;
        let before = leases.len();
        leases.retain(|_, lease| lease.expires_at >= now);
        Ok((before - leases.len()) as u64)
    }

    async fn get(&self, name: &str) -> CoordinationResult<Option<Lease>> {
        self.ensure_online()?;
        Ok(self.leases.lock().await.get(name).cloned())
    }

    async fn ping(&self) -> CoordinationResult<()> {
        self.ensure_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::seconds(30)
    }

    #[tokio::test]
    async fn test_acquire_free_lease() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();

        let lease = store.try_acquire("poll", "a", ttl(), now).await.unwrap();
        let lease = lease.expect("free lease should be acquired");
        assert_eq!(lease.owner_id, "a");
        assert_eq!(lease.expires_at, now + ttl());
    }

    #[tokio::test]
    async fn test_live_lease_rejects_other_owner() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();

        store.try_acquire("poll", "a", ttl(), now).await.unwrap();
        let second = store.try_acquire("poll", "b", ttl(), now).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_reacquire_by_owner_keeps_acquired_at() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();

        store.try_acquire("poll", "a", ttl(), now).await.unwrap();
        let later = now + Duration::seconds(10);
        let lease = store
            .try_acquire("poll", "a", ttl(), later)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(lease.acquired_at, now);
        assert_eq!(lease.expires_at, later + ttl());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();

        store.try_acquire("poll", "a", ttl(), now).await.unwrap();
        let after_expiry = now + ttl() + Duration::seconds(1);
        let lease = store
            .try_acquire("poll", "b", ttl(), after_expiry)
            .await
            .unwrap();
        assert_eq!(lease.unwrap().owner_id, "b");
    }

    #[tokio::test]
    async fn test_renew_requires_live_ownership() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();

        store.try_acquire("poll", "a", ttl(), now).await.unwrap();
        assert!(store.renew("poll", "b", ttl(), now).await.unwrap().is_none());

        let renewed = store
            .renew("poll", "a", ttl(), now + Duration::seconds(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.expires_at, now + Duration::seconds(45));

        let too_late = now + Duration::seconds(100);
        assert!(store.renew("poll", "a", ttl(), too_late).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();

        store.try_acquire("poll", "a", ttl(), now).await.unwrap();
        assert!(!store.release("poll", "b").await.unwrap());
        assert!(store.release("poll", "a").await.unwrap());
        assert!(store.get("poll").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let store = MemoryLeaseStore::new();
        let now = Utc::now();

        store.try_acquire("old", "a", Duration::seconds(5), now).await.unwrap();
        store.try_acquire("fresh", "a", Duration::seconds(60), now).await.unwrap();

        let removed = store.delete_expired(now + Duration::seconds(10)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_store_errors() {
        let store = MemoryLeaseStore::new();
        store.set_offline(true);

        let result = store.try_acquire("poll", "a", ttl(), Utc::now()).await;
        assert!(matches!(result, Err(CoordinationError::StoreUnavailable(_))));
        assert!(store.ping().await.is_err());

        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }
}
