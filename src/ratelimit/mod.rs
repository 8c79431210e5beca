//! Multi-tier request budget for the social platform API
//!
//! Every outbound API call made on behalf of an account must pass three
//! checks:
//!
//! 1. **Global budget** - requests across all accounts in the current
//!    window stay below `global_cap`.
//! 2. **Account budget** - requests for one account stay below
//!    `global_cap / account_cap_divisor`, leaving headroom for other
//!    subsystems that share the same platform quota.
//! 3. **Minimum gap** - consecutive requests for one account are at least
//!    `window / global_cap * min_gap_multiplier` apart.
//!
//! Windows are fixed and reset lazily: the first check after a window has
//! aged past `window_secs` starts a new one.
//!
//! # Usage
//!
//! ```rust,ignore
//! let limiter = RateLimiter::new(RateLimitConfig::default(), clock);
//!
//! match limiter.try_acquire("acct-1") {
//!     Ok(permit) => {
//!         let stats = client.fetch_account_stats(&credential).await?;
//!         permit.commit(); // request confirmed in flight
//!     }
//!     Err(decision) => tracing::debug!(?decision, "deferring poll"),
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::clock::SharedClock;

// ============================================================================
// Configuration
// ============================================================================

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed across all accounts per window
    pub global_cap: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Account cap is `global_cap / account_cap_divisor`
    pub account_cap_divisor: u32,

    /// Multiplier over the even spacing `window / global_cap`
    pub min_gap_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_cap: 200,
            window_secs: 3600,
            account_cap_divisor: 10,
            min_gap_multiplier: 10.0,
        }
    }
}

impl RateLimitConfig {
    /// Per-account request cap (never below 1)
    pub fn account_cap(&self) -> u32 {
        (self.global_cap / self.account_cap_divisor.max(1)).max(1)
    }

    /// Window length
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    /// Minimum spacing between two requests for the same account
    pub fn min_gap(&self) -> Duration {
        if self.global_cap == 0 {
            return self.window();
        }
        let even_spacing_ms = (self.window_secs as f64 * 1000.0) / self.global_cap as f64;
        Duration::milliseconds((even_spacing_ms * self.min_gap_multiplier) as i64)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.global_cap == 0 {
            return Err("rate_limit.global_cap must be greater than 0".to_string());
        }
        if self.window_secs == 0 {
            return Err("rate_limit.window_secs must be greater than 0".to_string());
        }
        if self.account_cap_divisor == 0 {
            return Err("rate_limit.account_cap_divisor must be greater than 0".to_string());
        }
        if self.min_gap_multiplier < 0.0 {
            return Err("rate_limit.min_gap_multiplier must not be negative".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Window Tracker
// ============================================================================

/// Request counter for one fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitTracker {
    pub window_start: DateTime<Utc>,
    pub requests_in_window: u32,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl RateLimitTracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            requests_in_window: 0,
            last_request_at: None,
        }
    }

    /// Start a fresh window if the current one is stale
    fn roll(&mut self, now: DateTime<Utc>, window: Duration) {
        if now - self.window_start >= window {
            self.window_start = now;
            self.requests_in_window = 0;
        }
    }

    fn remaining_window(&self, now: DateTime<Utc>, window: Duration) -> Duration {
        (self.window_start + window - now).max(Duration::zero())
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// All three checks pass
    Allowed,
    /// Global window budget used up
    GlobalExhausted { retry_after: Duration },
    /// Account window budget used up
    AccountExhausted { retry_after: Duration },
    /// Last request for the account was too recent
    TooSoon { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Time until the blocking check could pass
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::Allowed => Duration::zero(),
            Self::GlobalExhausted { retry_after }
            | Self::AccountExhausted { retry_after }
            | Self::TooSoon { retry_after } => *retry_after,
        }
    }

    /// Short label used in logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::GlobalExhausted { .. } => "global",
            Self::AccountExhausted { .. } => "account",
            Self::TooSoon { .. } => "min_gap",
        }
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

#[derive(Debug)]
struct LimiterState {
    global: RateLimitTracker,
    accounts: HashMap<String, RateLimitTracker>,
}

/// Multi-tier rate limiter
///
/// All state lives behind one mutex. Critical sections never await, so a
/// blocking mutex is sufficient and lets [`RateLimitPermit`] release its
/// reservation from `Drop`.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: Mutex::new(LimiterState {
                global: RateLimitTracker::new(now),
                accounts: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run all three checks without consuming budget
    pub fn check(&self, account_id: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let mut state = self.lock();
        Self::evaluate(&self.config, &mut state, account_id, now)
    }

    /// Whether a request for `account_id` may be issued now
    pub fn can_proceed(&self, account_id: &str) -> bool {
        self.check(account_id).is_allowed()
    }

    /// Count one issued request for `account_id`
    ///
    /// Call exactly once per request that actually went out.
    pub fn record(&self, account_id: &str) {
        let now = self.clock.now();
        let window = self.config.window();
        let mut state = self.lock();

        state.global.roll(now, window);
        state.global.requests_in_window += 1;
        state.global.last_request_at = Some(now);

        let tracker = state
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| RateLimitTracker::new(now));
        tracker.roll(now, window);
        tracker.requests_in_window += 1;
        tracker.last_request_at = Some(now);
    }

    /// Check and reserve budget in one step
    ///
    /// The reservation counts against both budgets immediately, so
    /// concurrent callers can never overshoot a cap. Call
    /// [`RateLimitPermit::commit`] once the request is confirmed in flight;
    /// dropping the permit uncommitted hands the budget back.
    pub fn try_acquire(&self, account_id: &str) -> Result<RateLimitPermit<'_>, RateLimitDecision> {
        let now = self.clock.now();
        let mut state = self.lock();

        let decision = Self::evaluate(&self.config, &mut state, account_id, now);
        if !decision.is_allowed() {
            return Err(decision);
        }

        state.global.requests_in_window += 1;
        let global_window = state.global.window_start;

        let tracker = state
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| RateLimitTracker::new(now));
        tracker.requests_in_window += 1;
        let account_window = tracker.window_start;

        Ok(RateLimitPermit {
            limiter: self,
            account_id: account_id.to_string(),
            global_window,
            account_window,
            committed: false,
        })
    }

    /// Snapshot of the global tracker
    pub fn global_usage(&self) -> RateLimitTracker {
        let now = self.clock.now();
        let mut state = self.lock();
        state.global.roll(now, self.config.window());
        state.global
    }

    /// Snapshot of one account's tracker
    pub fn account_usage(&self, account_id: &str) -> Option<RateLimitTracker> {
        let now = self.clock.now();
        let window = self.config.window();
        let mut state = self.lock();
        state.accounts.get_mut(account_id).map(|t| {
            t.roll(now, window);
            *t
        })
    }

    /// Forget an account's tracker (account deactivated)
    pub fn forget(&self, account_id: &str) {
        self.lock().accounts.remove(account_id);
    }

    fn evaluate(
        config: &RateLimitConfig,
        state: &mut LimiterState,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let window = config.window();

        state.global.roll(now, window);
        if state.global.requests_in_window >= config.global_cap {
            return RateLimitDecision::GlobalExhausted {
                retry_after: state.global.remaining_window(now, window),
            };
        }

        let Some(tracker) = state.accounts.get_mut(account_id) else {
            return RateLimitDecision::Allowed;
        };

        tracker.roll(now, window);
        if tracker.requests_in_window >= config.account_cap() {
            return RateLimitDecision::AccountExhausted {
                retry_after: tracker.remaining_window(now, window),
            };
        }

        if let Some(last) = tracker.last_request_at {
            let elapsed = now - last;
            let min_gap = config.min_gap();
            if elapsed < min_gap {
                return RateLimitDecision::TooSoon {
                    retry_after: min_gap - elapsed,
                };
            }
        }

        RateLimitDecision::Allowed
    }

    fn commit_reservation(&self, account_id: &str) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.global.last_request_at = Some(now);
        if let Some(tracker) = state.accounts.get_mut(account_id) {
            tracker.last_request_at = Some(now);
        }
    }

    fn release_reservation(
        &self,
        account_id: &str,
        global_window: DateTime<Utc>,
        account_window: DateTime<Utc>,
    ) {
        let mut state = self.lock();
        if state.global.window_start == global_window {
            state.global.requests_in_window = state.global.requests_in_window.saturating_sub(1);
        }
        if let Some(tracker) = state.accounts.get_mut(account_id) {
            if tracker.window_start == account_window {
                tracker.requests_in_window = tracker.requests_in_window.saturating_sub(1);
            }
        }
    }
}

/// Reserved request budget for one account
///
/// Released on drop unless committed.
#[must_use = "dropping a permit releases its reservation"]
pub struct RateLimitPermit<'a> {
    limiter: &'a RateLimiter,
    account_id: String,
    global_window: DateTime<Utc>,
    account_window: DateTime<Utc>,
    committed: bool,
}

impl RateLimitPermit<'_> {
    /// Mark the reserved request as issued
    pub fn commit(mut self) {
        self.committed = true;
        self.limiter.commit_reservation(&self.account_id);
    }
}

impl Drop for RateLimitPermit<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.limiter.release_reservation(
                &self.account_id,
                self.global_window,
                self.account_window,
            );
        }
    }
}
