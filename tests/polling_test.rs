//! Adaptive polling: interval precedence, change detection, loop lifecycle

mod common;

use std::sync::Arc;
use std::time::Duration;

use cadence::events::{AccountEvent, ChannelBroadcaster};
use cadence::models::PollingConfig;
use cadence::polling::{AdaptiveIntervals, IntervalKind, PollingScheduler, PollingSettings, TickOutcome};
use cadence::ratelimit::{RateLimitConfig, RateLimiter};
use cadence::storage::{ContentStore, MemoryContentStore};
use cadence::clock::Clock;
use chrono::TimeZone;

use common::{FakePlatform, FlakyStore, Scripted};

struct Harness {
    scheduler: PollingScheduler,
    store: Arc<MemoryContentStore>,
    platform: Arc<FakePlatform>,
    events: Arc<ChannelBroadcaster>,
    clock: cadence::clock::ManualClock,
}

async fn harness(script: Vec<Scripted>) -> Harness {
    let clock = common::test_clock();
    let store = common::store_with_account("acct-x").await;
    let platform = Arc::new(FakePlatform::with_stats(script));
    let events = Arc::new(ChannelBroadcaster::new(16));
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), common::shared(&clock)));

    let scheduler = PollingScheduler::new(
        PollingSettings::default(),
        store.clone(),
        platform.clone(),
        limiter,
        events.clone(),
        common::shared(&clock),
    );

    Harness {
        scheduler,
        store,
        platform,
        events,
        clock,
    }
}

#[test]
fn test_interval_precedence() {
    let intervals = AdaptiveIntervals::new(PollingSettings::default());
    let now = chrono::Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();

    // No-change backoff beats recent activity
    let mut config = PollingConfig::new("acct-x", "ws-1", "cred");
    config.consecutive_no_change_count = 5;
    config.last_user_activity_at = Some(now - chrono::Duration::minutes(2));
    assert_eq!(intervals.classify(&config, now), IntervalKind::Backoff);

    // Long inactivity selects the inactive interval
    let mut config = PollingConfig::new("acct-x", "ws-1", "cred");
    config.last_user_activity_at = Some(now - chrono::Duration::minutes(40));
    let (kind, delay) = intervals.next_interval(&config, now);
    assert_eq!(kind, IntervalKind::Inactive);
    assert_eq!(delay, Duration::from_secs(1800));
}

#[tokio::test]
async fn test_change_detection_updates_state_once() {
    let h = harness(vec![
        Scripted::Stats(common::stats(105, 12, 3.5)),
    ])
    .await;

    // Known baseline of 100 followers
    let mut config = h.store.get_polling_config("acct-x").await.unwrap().unwrap();
    config.apply_change(&common::stats(100, 12, 3.5));
    config.consecutive_no_change_count = 2;
    h.store.save_polling_config(&config).await.unwrap();

    let mut events = h.events.subscribe();

    let outcome = h.scheduler.tick("acct-x").await;
    assert!(matches!(outcome, TickOutcome::Changed { .. }));

    let stored = h.store.get_polling_config("acct-x").await.unwrap().unwrap();
    assert_eq!(stored.last_known_follower_count, Some(105));
    assert_eq!(stored.consecutive_no_change_count, 0);

    match events.try_recv().unwrap() {
        AccountEvent::StatsChanged { previous, current, .. } => {
            assert_eq!(previous.map(|p| p.follower_count), Some(100));
            assert_eq!(current.follower_count, 105);
        }
    }
    assert!(events.try_recv().is_err());
    assert_eq!(h.store.snapshot_count("acct-x").await, 1);

    // Same day, nothing new: no event, no second snapshot
    h.clock.advance(chrono::Duration::minutes(10));
    let outcome = h.scheduler.tick("acct-x").await;
    assert!(matches!(outcome, TickOutcome::Unchanged { .. }));
    assert!(events.try_recv().is_err());
    assert_eq!(h.store.snapshot_count("acct-x").await, 1);

    let snapshot = h
        .store
        .get_snapshot("acct-x", h.clock.now().date_naive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.follower_count, 105);
}

#[tokio::test]
async fn test_rate_limited_platform_does_not_count_as_change() {
    let h = harness(vec![Scripted::Status(429)]).await;

    let outcome = h.scheduler.tick("acct-x").await;
    assert!(matches!(outcome, TickOutcome::Failed { .. }));
    assert_eq!(outcome.next_delay(), Some(Duration::from_secs(120)));

    let stored = h.store.get_polling_config("acct-x").await.unwrap().unwrap();
    assert_eq!(stored.last_known_follower_count, None);
    assert_eq!(h.store.snapshot_count("acct-x").await, 0);
}

#[tokio::test]
async fn test_user_activity_shortens_interval() {
    let h = harness(vec![Scripted::Stats(common::stats(10, 1, 0.0))]).await;

    let first = h.scheduler.tick("acct-x").await;
    // Never active: inactive interval
    assert_eq!(
        first,
        TickOutcome::Changed {
            interval: IntervalKind::Inactive,
            delay: Duration::from_secs(1800),
        }
    );

    h.clock.advance(chrono::Duration::minutes(30));
    assert!(h.scheduler.record_user_activity("acct-x").await.unwrap());

    let second = h.scheduler.tick("acct-x").await;
    assert_eq!(
        second,
        TickOutcome::Unchanged {
            interval: IntervalKind::Active,
            delay: Duration::from_secs(60),
        }
    );
    assert_eq!(h.platform.stats_calls(), 2);
}

#[tokio::test]
async fn test_loops_follow_account_list() {
    let h = harness(vec![Scripted::Stats(common::stats(10, 1, 0.0))]).await;
    common::add_account(&h.store, "acct-y").await;

    assert_eq!(h.scheduler.start().await.unwrap(), 2);

    // Removed directly in the store (e.g. by another instance)
    h.store.delete_polling_config("acct-y").await.unwrap();
    assert_eq!(h.scheduler.sync_accounts().await.unwrap(), 1);
    assert!(!h.scheduler.registry().contains("acct-y"));

    h.scheduler.stop().await;
    assert_eq!(h.scheduler.active_accounts(), 0);
}

#[tokio::test]
async fn test_failed_state_write_keeps_change_pending() {
    let clock = common::test_clock();
    let store = Arc::new(FlakyStore::new(MemoryContentStore::new()));
    common::add_account(&store.inner, "acct-x").await;
    let platform = Arc::new(FakePlatform::with_stats(vec![Scripted::Stats(common::stats(
        105, 12, 3.5,
    ))]));
    let events = Arc::new(ChannelBroadcaster::new(16));
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), common::shared(&clock)));
    let scheduler = PollingScheduler::new(
        PollingSettings::default(),
        store.clone(),
        platform.clone(),
        limiter,
        events.clone(),
        common::shared(&clock),
    );

    let mut config = store.get_polling_config("acct-x").await.unwrap().unwrap();
    config.apply_change(&common::stats(100, 12, 3.5));
    store.save_polling_config(&config).await.unwrap();

    let mut rx = events.subscribe();

    // Stats fetched, then the state write fails
    store.fail_next_saves(1);
    let outcome = scheduler.tick("acct-x").await;
    assert!(matches!(outcome, TickOutcome::Failed { .. }));
    assert!(rx.try_recv().is_err());
    assert_eq!(store.inner.snapshot_count("acct-x").await, 0);
    assert_eq!(
        scheduler.registry().get("acct-x").unwrap().last_known_follower_count,
        Some(100)
    );

    // The next tick still sees the change
    clock.advance(chrono::Duration::minutes(10));
    let outcome = scheduler.tick("acct-x").await;
    assert!(matches!(outcome, TickOutcome::Changed { .. }));

    match rx.try_recv().unwrap() {
        AccountEvent::StatsChanged { previous, current, .. } => {
            assert_eq!(previous.map(|p| p.follower_count), Some(100));
            assert_eq!(current.follower_count, 105);
        }
    }
    assert!(rx.try_recv().is_err());
    assert_eq!(store.inner.snapshot_count("acct-x").await, 1);

    let stored = store.get_polling_config("acct-x").await.unwrap().unwrap();
    assert_eq!(stored.last_known_follower_count, Some(105));
    assert_eq!(platform.stats_calls(), 2);
}

#[tokio::test]
async fn test_manual_tick_waits_for_running_tick() {
    let h = harness(vec![Scripted::Stats(common::stats(10, 1, 0.0))]).await;
    let config = h.store.get_polling_config("acct-x").await.unwrap().unwrap();
    h.scheduler.registry().upsert(config);

    // A loop tick holds the account
    assert_eq!(h.scheduler.registry().try_begin_tick("acct-x"), Some(true));
    let outcome = h.scheduler.tick("acct-x").await;
    assert!(matches!(
        outcome,
        TickOutcome::Deferred {
            reason: "in_flight",
            ..
        }
    ));
    assert_eq!(h.platform.stats_calls(), 0);

    h.scheduler.registry().end_tick("acct-x");
    let outcome = h.scheduler.tick("acct-x").await;
    assert!(matches!(outcome, TickOutcome::Changed { .. }));
    assert_eq!(h.platform.stats_calls(), 1);

    // The guard is released after every tick
    h.clock.advance(chrono::Duration::minutes(10));
    let outcome = h.scheduler.tick("acct-x").await;
    assert!(matches!(outcome, TickOutcome::Unchanged { .. }));
}
