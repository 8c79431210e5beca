//! Lease mutual exclusion, failover and election across instances

mod common;

use std::sync::Arc;
use std::time::Duration;

use cadence::coordination::{
    CoordinationConfig, FailurePolicy, LeaderElector, LeaseStore, LockCoordinator,
    MemoryLeaseStore, Role,
};
use futures::future::join_all;

const TTL: Duration = Duration::from_secs(30);

fn coordinator(store: &Arc<MemoryLeaseStore>, clock: &cadence::clock::ManualClock, owner: &str) -> LockCoordinator {
    LockCoordinator::new(store.clone(), owner, common::shared(clock))
}

#[tokio::test]
async fn test_concurrent_acquire_has_single_winner() {
    let store = Arc::new(MemoryLeaseStore::new());
    let clock = common::test_clock();
    let owners: Vec<LockCoordinator> = (0..8)
        .map(|i| coordinator(&store, &clock, &format!("owner-{i}")))
        .collect();

    let results = join_all(owners.iter().map(|c| c.acquire("poll", TTL))).await;
    let winners = results
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();

    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_lease_failover_after_ttl() {
    let store = Arc::new(MemoryLeaseStore::new());
    let clock = common::test_clock();
    let a = coordinator(&store, &clock, "a");
    let b = coordinator(&store, &clock, "b");

    assert!(a.acquire("poll", TTL).await.unwrap());
    // A stops renewing (crash)
    drop(a);

    assert!(!b.acquire("poll", TTL).await.unwrap());
    clock.advance(chrono::Duration::seconds(29));
    assert!(!b.acquire("poll", TTL).await.unwrap());
    clock.advance(chrono::Duration::seconds(2));
    assert!(b.acquire("poll", TTL).await.unwrap());

    let lease = store.get("poll").await.unwrap().unwrap();
    assert_eq!(lease.owner_id, "b");
}

#[tokio::test]
async fn test_release_hands_lease_over_immediately() {
    let store = Arc::new(MemoryLeaseStore::new());
    let clock = common::test_clock();
    let a = coordinator(&store, &clock, "a");
    let b = coordinator(&store, &clock, "b");

    assert!(a.acquire("poll", TTL).await.unwrap());
    assert!(a.release("poll").await.unwrap());
    assert!(b.acquire("poll", TTL).await.unwrap());
    assert!(!a.is_held("poll"));
}

#[tokio::test]
async fn test_single_leader_across_instances() {
    let store = Arc::new(MemoryLeaseStore::new());
    let clock = common::test_clock();
    let config = CoordinationConfig {
        health_probe_delay_secs: 0,
        ..Default::default()
    };

    let electors: Vec<LeaderElector> = ["a", "b", "c"]
        .iter()
        .map(|owner| {
            LeaderElector::new(
                Arc::new(coordinator(&store, &clock, owner)),
                config.clone(),
            )
        })
        .collect();

    let roles = join_all(electors.iter().map(|e| e.elect())).await;
    let leaders = roles.iter().filter(|r| r.is_leader()).count();
    assert!(leaders <= 1, "at most one leader, got {leaders}");

    // Contention may leave nobody leading; a sequential retry settles it
    if leaders == 0 {
        for elector in &electors {
            elector.elect().await;
        }
    }
    let leaders = electors.iter().filter(|e| e.role() == Role::Leader).count();
    assert_eq!(leaders, 1);
}

#[tokio::test]
async fn test_failure_policy_is_explicit() {
    let store = Arc::new(MemoryLeaseStore::new());
    let clock = common::test_clock();
    store.set_offline(true);

    let closed = LeaderElector::new(
        Arc::new(coordinator(&store, &clock, "a")),
        CoordinationConfig {
            health_probe_delay_secs: 0,
            ..Default::default()
        },
    );
    assert_eq!(closed.elect().await, Role::Follower);

    let open = LeaderElector::new(
        Arc::new(coordinator(&store, &clock, "b")),
        CoordinationConfig {
            health_probe_delay_secs: 0,
            failure_policy: FailurePolicy::FailOpen,
            ..Default::default()
        },
    );
    assert_eq!(open.elect().await, Role::Leader);
    assert!(open.is_degraded());
}
