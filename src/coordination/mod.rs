//! Distributed coordination between service instances
//!
//! - [`LeaseStore`]: atomic lease rows in a shared store (PostgreSQL or memory)
//! - [`LockCoordinator`]: acquire/renew/release with background renewal
//! - [`LeaderElector`]: two-lease leadership with an explicit failure policy

pub mod config;
pub mod error;
pub mod leader;
pub mod lock;
pub mod postgres;
pub mod store;

pub use config::{CoordinationConfig, FailurePolicy};
pub use error::{CoordinationError, CoordinationResult};
pub use leader::{LeaderElector, Role};
pub use lock::{LeaseStatus, LockCoordinator};
pub use postgres::PostgresLeaseStore;
pub use store::{Lease, LeaseStore, MemoryLeaseStore};
