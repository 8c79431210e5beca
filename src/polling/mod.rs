//! Adaptive account polling
//!
//! - [`interval`]: picks the delay until an account's next poll
//! - [`registry`]: in-memory polling state of every monitored account
//! - [`scheduler`]: one cancelable loop per account, run by the leader

pub mod error;
pub mod interval;
pub mod registry;
pub mod scheduler;

pub use error::{PollError, PollResult};
pub use interval::{AdaptiveIntervals, IntervalKind, PollingSettings};
pub use registry::{AccountView, LoopState, PollingRegistry};
pub use scheduler::{PollingScheduler, TickOutcome};
