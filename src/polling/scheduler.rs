//! Adaptive polling scheduler
//!
//! Runs one cancelable loop per monitored account. Each tick resolves the
//! account's credential, asks the rate limiter for budget, fetches stats
//! and compares them with the last known values. A change resets the
//! no-change streak, writes the day's snapshot (once) and emits an event.
//!
//! Only the leader runs loops. [`PollingScheduler::start`] loads every
//! account from the store; [`PollingScheduler::stop`] cancels all loops
//! when leadership is lost.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{PollError, PollResult};
use super::interval::{AdaptiveIntervals, IntervalKind, PollingSettings};
use super::registry::{AccountView, LoopState, PollingRegistry};
use crate::clock::{to_chrono, to_std, SharedClock};
use crate::events::{AccountEvent, EventBroadcaster};
use crate::metrics;
use crate::models::{AccountStats, AnalyticsSnapshot, PollingConfig};
use crate::platform::SocialPlatformClient;
use crate::ratelimit::RateLimiter;
use crate::storage::ContentStore;

// ============================================================================
// Tick Outcome
// ============================================================================

/// Result of one poll tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Rate limiter refused; no request was made
    Deferred { reason: &'static str, delay: Duration },
    /// Stats changed; snapshot and event written
    Changed { interval: IntervalKind, delay: Duration },
    /// Stats unchanged
    Unchanged { interval: IntervalKind, delay: Duration },
    /// Tick failed; retried after the error backoff
    Failed { error: String, delay: Duration },
    /// Account no longer exists; the loop ends
    Stopped,
}

impl TickOutcome {
    /// Delay before the next tick, or `None` if the loop should end
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            Self::Deferred { delay, .. }
            | Self::Changed { delay, .. }
            | Self::Unchanged { delay, .. }
            | Self::Failed { delay, .. } => Some(*delay),
            Self::Stopped => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Deferred { .. } => "deferred",
            Self::Changed { .. } => "changed",
            Self::Unchanged { .. } => "unchanged",
            Self::Failed { .. } => "error",
            Self::Stopped => "stopped",
        }
    }
}

// ============================================================================
// Tick Logic
// ============================================================================

/// Shared between the scheduler handle and every account loop
struct PollingCore {
    intervals: AdaptiveIntervals,
    store: Arc<dyn ContentStore>,
    client: Arc<dyn SocialPlatformClient>,
    limiter: Arc<RateLimiter>,
    events: Arc<dyn EventBroadcaster>,
    clock: SharedClock,
    registry: Arc<PollingRegistry>,
}

impl PollingCore {
    fn settings(&self) -> &PollingSettings {
        self.intervals.settings()
    }

    async fn tick(&self, account_id: &str) -> TickOutcome {
        let _guard = match TickGuard::acquire(&self.registry, account_id) {
            Some(Some(guard)) => guard,
            Some(None) => {
                debug!(account_id, "Tick already in flight, deferring");
                let outcome = TickOutcome::Deferred {
                    reason: "in_flight",
                    delay: self.settings().rate_limit_deferral(),
                };
                metrics::record_poll(outcome.label());
                return outcome;
            }
            None => return TickOutcome::Stopped,
        };

        let outcome = match self.try_tick(account_id).await {
            Ok(outcome) => outcome,
            Err(PollError::UnknownAccount(_)) => TickOutcome::Stopped,
            Err(e) => {
                warn!(account_id, error = %e, recoverable = e.is_recoverable(), "Poll tick failed");
                TickOutcome::Failed {
                    error: e.to_string(),
                    delay: self.settings().error_backoff(),
                }
            }
        };

        metrics::record_poll(outcome.label());
        outcome
    }

    async fn try_tick(&self, account_id: &str) -> PollResult<TickOutcome> {
        // The stored row is the source of truth for deactivation and for
        // user activity recorded by other instances.
        let Some(stored) = self.store.get_polling_config(account_id).await? else {
            info!(account_id, "Account no longer registered, stopping loop");
            self.registry.remove(account_id);
            return Ok(TickOutcome::Stopped);
        };

        let config = self
            .registry
            .update(account_id, |c| {
                c.last_user_activity_at = c.last_user_activity_at.max(stored.last_user_activity_at);
                c.credential_ref = stored.credential_ref.clone();
            })
            .ok_or_else(|| PollError::UnknownAccount(account_id.to_string()))?;

        let credential = self
            .store
            .resolve_credential(&config.credential_ref)
            .await?
            .ok_or_else(|| PollError::MissingCredential(config.credential_ref.clone()))?;

        let permit = match self.limiter.try_acquire(account_id) {
            Ok(permit) => permit,
            Err(decision) => {
                let delay = to_std(decision.retry_after())
                    .min(self.settings().rate_limit_deferral())
                    .max(Duration::from_secs(1));
                metrics::record_deferral(decision.reason());
                debug!(
                    account_id,
                    reason = decision.reason(),
                    delay_secs = delay.as_secs(),
                    "Poll deferred by rate limiter"
                );
                return Ok(TickOutcome::Deferred {
                    reason: decision.reason(),
                    delay,
                });
            }
        };

        let stats = {
            let _timer = metrics::start_api_timer("fetch_account_stats");
            match self.client.fetch_account_stats(&credential).await {
                Ok(stats) => {
                    permit.commit();
                    stats
                }
                Err(e) => {
                    if e.was_issued() {
                        permit.commit();
                    } else {
                        drop(permit);
                    }
                    return Err(e.into());
                }
            }
        };

        let now = self.clock.now();
        let changed = config.differs_from(&stats, self.settings().change_epsilon);
        let previous = previous_stats(&config);

        let mut updated = config;
        if changed {
            updated.apply_change(&stats);
        } else {
            updated.record_no_change();
        }
        updated.last_polled_at = Some(now);

        // The registry keeps the old stats until the change is durable, so
        // a failed write is seen as a change again on the next tick
        self.store.save_polling_config(&updated).await?;
        if changed {
            self.on_change(&updated, previous, stats, now).await?;
        }

        self.registry
            .update(account_id, |c| {
                let activity = c.last_user_activity_at.max(updated.last_user_activity_at);
                *c = updated.clone();
                c.last_user_activity_at = activity;
            })
            .ok_or_else(|| PollError::UnknownAccount(account_id.to_string()))?;

        if !changed {
            debug!(
                account_id,
                streak = updated.consecutive_no_change_count,
                "Account stats unchanged"
            );
        }

        let (interval, delay) = self.intervals.next_interval(&updated, now);
        Ok(if changed {
            TickOutcome::Changed { interval, delay }
        } else {
            TickOutcome::Unchanged { interval, delay }
        })
    }

    async fn on_change(
        &self,
        config: &PollingConfig,
        previous: Option<AccountStats>,
        current: AccountStats,
        now: DateTime<Utc>,
    ) -> PollResult<()> {
        let snapshot = AnalyticsSnapshot {
            account_id: config.account_id.clone(),
            workspace_id: config.workspace_id.clone(),
            date: self.settings().local_date(now),
            follower_count: current.follower_count,
            media_count: current.media_count,
            engagement: current.engagement,
            captured_at: now,
        };
        let snapshot_written = self.store.insert_snapshot_if_absent(&snapshot).await?;

        let receivers = self.events.broadcast(AccountEvent::StatsChanged {
            account_id: config.account_id.clone(),
            workspace_id: config.workspace_id.clone(),
            previous,
            current,
            observed_at: now,
        });

        info!(
            account_id = %config.account_id,
            followers = current.follower_count,
            media = current.media_count,
            snapshot_written,
            receivers,
            "Account stats changed"
        );
        Ok(())
    }
}

/// Holds an account's in-flight flag for the length of one tick
struct TickGuard<'a> {
    registry: &'a PollingRegistry,
    account_id: &'a str,
}

impl<'a> TickGuard<'a> {
    /// `None` for an unknown account, `Some(None)` when already ticking
    fn acquire(registry: &'a PollingRegistry, account_id: &'a str) -> Option<Option<Self>> {
        registry.try_begin_tick(account_id).map(|started| {
            started.then_some(Self {
                registry,
                account_id,
            })
        })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_tick(self.account_id);
    }
}

fn previous_stats(config: &PollingConfig) -> Option<AccountStats> {
    match (
        config.last_known_follower_count,
        config.last_known_media_count,
        config.last_engagement_snapshot,
    ) {
        (Some(follower_count), Some(media_count), Some(engagement)) => Some(AccountStats {
            follower_count,
            media_count,
            engagement,
        }),
        _ => None,
    }
}

async fn run_account_loop(core: Arc<PollingCore>, account_id: String, mut stop: watch::Receiver<bool>) {
    debug!(account_id = %account_id, "Polling loop started");

    loop {
        if *stop.borrow() {
            break;
        }

        core.registry.set_state(&account_id, LoopState::Polling);
        let outcome = core.tick(&account_id).await;
        let Some(delay) = outcome.next_delay() else {
            break;
        };

        let next_tick_at = core.clock.now() + to_chrono(delay);
        core.registry
            .set_state(&account_id, LoopState::Scheduled { next_tick_at });

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    core.registry.set_state(&account_id, LoopState::Stopped);
    debug!(account_id = %account_id, "Polling loop stopped");
}

// ============================================================================
// Scheduler
// ============================================================================

struct AccountLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the per-account polling loops on the leader
pub struct PollingScheduler {
    core: Arc<PollingCore>,
    loops: Mutex<HashMap<String, AccountLoop>>,
    running: AtomicBool,
}

impl PollingScheduler {
    pub fn new(
        settings: PollingSettings,
        store: Arc<dyn ContentStore>,
        client: Arc<dyn SocialPlatformClient>,
        limiter: Arc<RateLimiter>,
        events: Arc<dyn EventBroadcaster>,
        clock: SharedClock,
    ) -> Self {
        Self {
            core: Arc::new(PollingCore {
                intervals: AdaptiveIntervals::new(settings),
                store,
                client,
                limiter,
                events,
                clock,
                registry: Arc::new(PollingRegistry::new()),
            }),
            loops: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<PollingRegistry> {
        &self.core.registry
    }

    pub fn intervals(&self) -> &AdaptiveIntervals {
        &self.core.intervals
    }

    /// Whether loops are being run (this instance is the polling leader)
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of accounts with a live loop
    pub fn active_accounts(&self) -> usize {
        self.lock_loops().len()
    }

    pub fn views(&self) -> Vec<AccountView> {
        self.core.registry.views()
    }

    fn lock_loops(&self) -> MutexGuard<'_, HashMap<String, AccountLoop>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start polling every stored account
    ///
    /// Returns the number of accounts being polled.
    pub async fn start(&self) -> PollResult<usize> {
        self.running.store(true, Ordering::SeqCst);
        let count = self.sync_accounts().await?;
        info!(accounts = count, "Polling scheduler started");
        Ok(count)
    }

    /// Reconcile running loops with the stored account list
    ///
    /// Starts loops for new accounts and stops loops for accounts that
    /// were removed. No-op unless the scheduler is running.
    pub async fn sync_accounts(&self) -> PollResult<usize> {
        if !self.is_running() {
            return Ok(0);
        }

        let configs = self.core.store.list_polling_configs().await?;
        let wanted: Vec<String> = configs.iter().map(|c| c.account_id.clone()).collect();

        for config in configs {
            let account_id = config.account_id.clone();
            if !self.core.registry.contains(&account_id) {
                self.core.registry.upsert(config);
            }
            self.spawn_loop(&account_id);
        }

        let stale: Vec<String> = self
            .lock_loops()
            .keys()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();
        for account_id in stale {
            self.stop_loop(&account_id).await;
            self.core.registry.remove(&account_id);
        }

        let active = self.active_accounts();
        metrics::set_active_accounts(active);
        Ok(active)
    }

    /// Register an account for polling
    ///
    /// Persists the config; the loop starts immediately when this instance
    /// is running the scheduler, otherwise on the leader's next sync.
    pub async fn add_account(&self, config: PollingConfig) -> PollResult<()> {
        self.core.store.save_polling_config(&config).await?;
        let account_id = config.account_id.clone();

        if self.is_running() {
            self.core.registry.upsert(config);
            self.spawn_loop(&account_id);
            metrics::set_active_accounts(self.active_accounts());
        }

        info!(account_id = %account_id, "Account registered for polling");
        Ok(())
    }

    /// Stop polling an account and delete its polling state
    pub async fn remove_account(&self, account_id: &str) -> PollResult<bool> {
        let existed = self.core.store.delete_polling_config(account_id).await?;
        self.stop_loop(account_id).await;
        self.core.registry.remove(account_id);
        self.core.limiter.forget(account_id);
        metrics::set_active_accounts(self.active_accounts());

        if existed {
            info!(account_id, "Account removed from polling");
        }
        Ok(existed)
    }

    /// Record user activity for an account
    ///
    /// Safe to call on any instance; the leader merges it on the next tick.
    pub async fn record_user_activity(&self, account_id: &str) -> PollResult<bool> {
        let now = self.core.clock.now();
        let found = self.core.store.record_user_activity(account_id, now).await?;
        self.core.registry.update(account_id, |c| {
            c.last_user_activity_at = c.last_user_activity_at.max(Some(now));
        });
        Ok(found)
    }

    /// Run one tick for an account outside its loop
    ///
    /// Shares the per-account guard with the loop: while another tick for
    /// the account is running this returns `Deferred` with reason
    /// `in_flight` and makes no request.
    pub async fn tick(&self, account_id: &str) -> TickOutcome {
        if !self.core.registry.contains(account_id) {
            match self.core.store.get_polling_config(account_id).await {
                Ok(Some(config)) => {
                    self.core.registry.upsert(config);
                }
                Ok(None) => return TickOutcome::Stopped,
                Err(e) => {
                    return TickOutcome::Failed {
                        error: e.to_string(),
                        delay: self.core.settings().error_backoff(),
                    }
                }
            }
        }
        self.core.tick(account_id).await
    }

    /// Cancel every loop and clear the in-memory state
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let loops: Vec<(String, AccountLoop)> = self.lock_loops().drain().collect();
        let count = loops.len();
        for (_, account_loop) in &loops {
            let _ = account_loop.stop.send(true);
        }
        for (account_id, account_loop) in loops {
            if let Err(e) = account_loop.handle.await {
                if !e.is_cancelled() {
                    warn!(account_id = %account_id, error = %e, "Polling loop panicked");
                }
            }
        }

        for account_id in self.core.registry.account_ids() {
            self.core.registry.remove(&account_id);
        }
        metrics::set_active_accounts(0);

        if count > 0 {
            info!(accounts = count, "Polling scheduler stopped");
        }
    }

    fn spawn_loop(&self, account_id: &str) {
        let mut loops = self.lock_loops();
        if let Some(existing) = loops.get(account_id) {
            if !existing.handle.is_finished() {
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_account_loop(
            Arc::clone(&self.core),
            account_id.to_string(),
            stop_rx,
        ));
        loops.insert(
            account_id.to_string(),
            AccountLoop {
                stop: stop_tx,
                handle,
            },
        );
    }

    async fn stop_loop(&self, account_id: &str) {
        let account_loop = self.lock_loops().remove(account_id);
        if let Some(account_loop) = account_loop {
            let _ = account_loop.stop.send(true);
            let _ = account_loop.handle.await;
        }
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for (_, account_loop) in self.lock_loops().drain() {
            account_loop.handle.abort();
        }
    }
}
