//! Adaptive polling interval policy
//!
//! Pure function of the account's polling state and the current time, so
//! it can be tested without a running loop. Rules are checked in a fixed
//! order and the first match wins:
//!
//! 1. local time inside the night window
//! 2. no user activity for longer than the inactivity threshold
//! 3. `consecutive_no_change_count` at or above the backoff threshold
//! 4. user activity within the "recently active" threshold
//! 5. default

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::PollingConfig;

/// Polling loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub default_interval_secs: u64,
    pub active_interval_secs: u64,
    pub backoff_interval_secs: u64,
    pub inactive_interval_secs: u64,
    pub night_interval_secs: u64,

    /// Night window start hour (local, inclusive)
    pub night_start_hour: u32,
    /// Night window end hour (local, exclusive); equal to start disables it
    pub night_end_hour: u32,
    /// Offset of local time from UTC in minutes
    pub utc_offset_minutes: i32,

    /// No activity for longer than this selects the inactive interval
    pub inactivity_threshold_secs: u64,
    /// Activity within this selects the active interval
    pub active_threshold_secs: u64,
    /// No-change streak that selects the backoff interval
    pub backoff_no_change_count: u32,

    /// Upper bound on the delay after a rate-limit deferral
    pub rate_limit_deferral_secs: u64,
    /// Fixed delay after a failed tick
    pub error_backoff_secs: u64,
    /// Engagement differences at or below this count as unchanged
    pub change_epsilon: f64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: 300,
            active_interval_secs: 60,
            backoff_interval_secs: 900,
            inactive_interval_secs: 1800,
            night_interval_secs: 3600,
            night_start_hour: 0,
            night_end_hour: 6,
            utc_offset_minutes: 0,
            inactivity_threshold_secs: 1800,
            active_threshold_secs: 300,
            backoff_no_change_count: 5,
            rate_limit_deferral_secs: 30,
            error_backoff_secs: 120,
            change_epsilon: 0.0001,
        }
    }
}

impl PollingSettings {
    pub fn rate_limit_deferral(&self) -> Duration {
        Duration::from_secs(self.rate_limit_deferral_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.night_start_hour > 23 || self.night_end_hour > 23 {
            return Err("polling night hours must be between 0 and 23".to_string());
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err("polling.utc_offset_minutes must be within one day".to_string());
        }
        if self.active_threshold_secs > self.inactivity_threshold_secs {
            return Err(
                "polling.active_threshold_secs must not exceed inactivity_threshold_secs"
                    .to_string(),
            );
        }
        let intervals = [
            self.default_interval_secs,
            self.active_interval_secs,
            self.backoff_interval_secs,
            self.inactive_interval_secs,
            self.night_interval_secs,
            self.rate_limit_deferral_secs,
            self.error_backoff_secs,
        ];
        if intervals.contains(&0) {
            return Err("polling intervals must be greater than 0".to_string());
        }
        if self.change_epsilon < 0.0 {
            return Err("polling.change_epsilon must not be negative".to_string());
        }
        Ok(())
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Calendar date in local time (used to key daily snapshots)
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }

    /// Whether `now` falls inside the night window
    pub fn is_night(&self, now: DateTime<Utc>) -> bool {
        let (start, end) = (self.night_start_hour, self.night_end_hour);
        if start == end {
            return false;
        }

        let hour = now.with_timezone(&self.offset()).hour();
        if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

/// Which rule picked the interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    Night,
    Inactive,
    Backoff,
    Active,
    Default,
}

impl IntervalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Night => "night",
            Self::Inactive => "inactive",
            Self::Backoff => "backoff",
            Self::Active => "active",
            Self::Default => "default",
        }
    }
}

/// Interval policy over [`PollingSettings`]
#[derive(Debug, Clone)]
pub struct AdaptiveIntervals {
    settings: PollingSettings,
}

impl AdaptiveIntervals {
    pub fn new(settings: PollingSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PollingSettings {
        &self.settings
    }

    /// Pick the rule for the next tick
    ///
    /// An account with no recorded user activity counts as inactive.
    pub fn classify(&self, config: &PollingConfig, now: DateTime<Utc>) -> IntervalKind {
        let s = &self.settings;

        if s.is_night(now) {
            return IntervalKind::Night;
        }

        let since_activity = config.last_user_activity_at.map(|at| now - at);
        let inactivity = ChronoDuration::seconds(s.inactivity_threshold_secs as i64);
        if since_activity.map_or(true, |elapsed| elapsed > inactivity) {
            return IntervalKind::Inactive;
        }

        if config.consecutive_no_change_count >= s.backoff_no_change_count {
            return IntervalKind::Backoff;
        }

        let active = ChronoDuration::seconds(s.active_threshold_secs as i64);
        if since_activity.is_some_and(|elapsed| elapsed <= active) {
            return IntervalKind::Active;
        }

        IntervalKind::Default
    }

    /// Length of the interval a rule maps to
    pub fn interval_for(&self, kind: IntervalKind) -> Duration {
        let s = &self.settings;
        let secs = match kind {
            IntervalKind::Night => s.night_interval_secs,
            IntervalKind::Inactive => s.inactive_interval_secs,
            IntervalKind::Backoff => s.backoff_interval_secs,
            IntervalKind::Active => s.active_interval_secs,
            IntervalKind::Default => s.default_interval_secs,
        };
        Duration::from_secs(secs)
    }

    /// Delay until the next tick
    pub fn next_interval(&self, config: &PollingConfig, now: DateTime<Utc>) -> (IntervalKind, Duration) {
        let kind = self.classify(config, now);
        (kind, self.interval_for(kind))
    }
}
