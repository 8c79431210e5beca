//! Service wiring and task lifecycle
//!
//! Probes the backends once at startup, builds every component, and runs
//! the long-lived tasks:
//!
//! - the election loop (every instance)
//! - the polling supervisor, which starts the [`PollingScheduler`] when this
//!   instance becomes leader and stops it when leadership is lost
//! - the publish worker and the fallback sweep (every instance)
//! - the HTTP control plane
//!
//! Shutdown flips a single watch channel; every task drains and the
//! election loop releases its leases on the way out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{ApiServer, AppState};
use crate::clock::{system_clock, SharedClock};
use crate::config::Config;
use crate::coordination::{
    LeaderElector, LeaseStore, LockCoordinator, MemoryLeaseStore, PostgresLeaseStore, Role,
};
use crate::error::{Error, Result};
use crate::events::ChannelBroadcaster;
use crate::platform::{HttpPlatformClient, SocialPlatformClient};
use crate::polling::PollingScheduler;
use crate::publish::{
    select_backend, ContentPublisher, FallbackScheduler, PublishQueue, PublishWorker, QueueBackend,
};
use crate::ratelimit::RateLimiter;
use crate::storage::{create_pool, ContentStore, DatabaseConfig, MemoryContentStore, PostgresContentStore};

/// Capacity of the account event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Backend Probes
// ============================================================================

/// Lease and content stores selected at startup
#[derive(Clone)]
pub struct Stores {
    pub leases: Arc<dyn LeaseStore>,
    pub content: Arc<dyn ContentStore>,
    /// Backed by PostgreSQL and shared with other instances
    pub shared: bool,
}

impl Stores {
    /// Process-local stores; every instance elects itself
    pub fn in_memory() -> Self {
        Self {
            leases: Arc::new(MemoryLeaseStore::new()),
            content: Arc::new(MemoryContentStore::new()),
            shared: false,
        }
    }
}

/// Connect to PostgreSQL and create the schema
///
/// Fails when the database is unreachable.
pub async fn connect_postgres(config: &DatabaseConfig) -> Result<Stores> {
    let pool = create_pool(config).await?;
    let content = PostgresContentStore::new(pool.clone());
    content.ping().await?;
    content.init_schema().await?;

    let leases = PostgresLeaseStore::new(pool);
    leases.init_schema().await?;

    Ok(Stores {
        leases: Arc::new(leases),
        content: Arc::new(content),
        shared: true,
    })
}

/// Use PostgreSQL when reachable, otherwise process-local stores
pub async fn select_stores(config: &DatabaseConfig) -> Stores {
    match connect_postgres(config).await {
        Ok(stores) => {
            info!("Using PostgreSQL lease and content stores");
            stores
        }
        Err(e) => {
            warn!(
                error = %e,
                "PostgreSQL unavailable, using in-memory stores (single-instance mode)"
            );
            Stores::in_memory()
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// Every component of a running instance
pub struct Service {
    config: Config,
    clock: SharedClock,
    stores: Stores,
    elector: Arc<LeaderElector>,
    scheduler: Arc<PollingScheduler>,
    queue: Arc<PublishQueue>,
    worker: Arc<PublishWorker>,
    fallback: Arc<FallbackScheduler>,
    events: Arc<ChannelBroadcaster>,
}

impl Service {
    /// Probe the backends and build the service
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let stores = select_stores(&config.database).await;
        let backend = select_backend(&config.redis).await;
        let client = Arc::new(HttpPlatformClient::new(&config.platform)?);

        Ok(Self::from_parts(config, stores, backend, client, system_clock()))
    }

    /// Build the service from already selected backends
    pub fn from_parts(
        config: Config,
        stores: Stores,
        backend: Arc<dyn QueueBackend>,
        client: Arc<dyn SocialPlatformClient>,
        clock: SharedClock,
    ) -> Self {
        let locks = Arc::new(
            LockCoordinator::new(
                stores.leases.clone(),
                config.coordination.instance_id.clone(),
                clock.clone(),
            )
            .with_renewal_interval(config.coordination.renewal_interval()),
        );
        let elector = Arc::new(LeaderElector::new(locks, config.coordination.clone()));

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
        let events = Arc::new(ChannelBroadcaster::new(EVENT_CHANNEL_CAPACITY));
        let scheduler = Arc::new(PollingScheduler::new(
            config.polling.clone(),
            stores.content.clone(),
            client.clone(),
            limiter,
            events.clone(),
            clock.clone(),
        ));

        let queue = Arc::new(PublishQueue::new(backend, stores.content.clone(), clock.clone()));
        let publisher = Arc::new(ContentPublisher::new(
            stores.content.clone(),
            client,
            clock.clone(),
            config.publish.clone(),
        ));
        let worker = Arc::new(PublishWorker::new(
            queue.clone(),
            publisher.clone(),
            config.publish.clone(),
        ));
        let fallback = Arc::new(FallbackScheduler::new(
            queue.clone(),
            publisher,
            stores.content.clone(),
            clock.clone(),
            config.fallback.clone(),
        ));

        Self {
            config,
            clock,
            stores,
            elector,
            scheduler,
            queue,
            worker,
            fallback,
            events,
        }
    }

    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    pub fn scheduler(&self) -> &Arc<PollingScheduler> {
        &self.scheduler
    }

    pub fn queue(&self) -> &Arc<PublishQueue> {
        &self.queue
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn events(&self) -> &Arc<ChannelBroadcaster> {
        &self.events
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.elector.clone(),
            self.scheduler.clone(),
            self.queue.clone(),
            self.clock.clone(),
        )
    }

    /// Run every task until `shutdown_signal` resolves
    pub async fn run(self, shutdown_signal: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        info!(
            instance_id = %self.config.coordination.instance_id,
            shared_stores = self.stores.shared,
            queue_backend = self.queue.backend().name(),
            "Starting cadence service"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push((
            "election",
            tokio::spawn(Arc::clone(&self.elector).run(shutdown_rx.clone())),
        ));
        tasks.push((
            "polling",
            tokio::spawn(supervise_polling(
                Arc::clone(&self.scheduler),
                self.elector.subscribe(),
                shutdown_rx.clone(),
                self.config.coordination.election_retry(),
            )),
        ));
        tasks.push((
            "worker",
            tokio::spawn(Arc::clone(&self.worker).run(shutdown_rx.clone())),
        ));
        tasks.push((
            "fallback",
            tokio::spawn(Arc::clone(&self.fallback).run(shutdown_rx.clone())),
        ));

        let server = ApiServer::new(self.config.server.clone(), self.app_state());
        let mut server_shutdown = shutdown_rx.clone();
        let server_task = tokio::spawn(async move {
            server
                .start_with_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await
        });

        shutdown_signal.await;
        info!("Shutdown requested, stopping tasks");
        let _ = shutdown_tx.send(true);

        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Task ended abnormally");
            }
        }

        let served = server_task
            .await
            .map_err(|e| Error::with_source("Control plane task failed", e))?;
        served.map_err(|e| Error::with_source("Control plane failed", e))?;

        info!("cadence service stopped");
        Ok(())
    }
}

/// Follow the elected role: poll while leader, idle while follower
///
/// While leading, the account list is reconciled every `sync_every` so
/// accounts added or removed through other instances are picked up.
pub async fn supervise_polling(
    scheduler: Arc<PollingScheduler>,
    mut role: watch::Receiver<Role>,
    mut shutdown: watch::Receiver<bool>,
    sync_every: Duration,
) {
    let mut ticker = tokio::time::interval(sync_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let initial = *role.borrow_and_update();
    apply_role(&scheduler, initial).await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = role.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *role.borrow_and_update();
                apply_role(&scheduler, current).await;
            }
            _ = ticker.tick() => {
                if scheduler.is_running() {
                    if let Err(e) = scheduler.sync_accounts().await {
                        warn!(error = %e, "Account sync failed");
                    }
                }
            }
        }
    }

    scheduler.stop().await;
}

async fn apply_role(scheduler: &PollingScheduler, role: Role) {
    match (role.is_leader(), scheduler.is_running()) {
        (true, false) => {
            if let Err(e) = scheduler.start().await {
                warn!(error = %e, "Failed to start polling, retrying on next sync");
            }
        }
        (false, true) => scheduler.stop().await,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AccountStats, Credential, PollingConfig};
    use crate::platform::{PlatformError, PublishReceipt, PublishRequest};
    use crate::publish::MemoryQueueBackend;
    use async_trait::async_trait;

    struct StaticClient;

    #[async_trait]
    impl SocialPlatformClient for StaticClient {
        async fn fetch_account_stats(&self, _: &Credential) -> std::result::Result<AccountStats, PlatformError> {
            Ok(AccountStats {
                follower_count: 10,
                media_count: 1,
                engagement: 0.5,
            })
        }

        async fn publish(
            &self,
            _: &Credential,
            _: &PublishRequest,
        ) -> std::result::Result<PublishReceipt, PlatformError> {
            Ok(PublishReceipt {
                external_id: "post-1".to_string(),
            })
        }
    }

    fn service() -> Service {
        Service::from_parts(
            Config::default(),
            Stores::in_memory(),
            Arc::new(MemoryQueueBackend::new()),
            Arc::new(StaticClient),
            Arc::new(ManualClock::starting_now()),
        )
    }

    #[tokio::test]
    async fn test_supervisor_follows_role() {
        let service = service();
        service
            .stores()
            .content
            .save_polling_config(&PollingConfig::new("acct-1", "ws-1", "cred-1"))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise_polling(
            service.scheduler().clone(),
            service.elector().subscribe(),
            shutdown_rx,
            Duration::from_secs(3600),
        ));

        assert_eq!(service.elector().elect().await, Role::Leader);
        for _ in 0..50 {
            if service.scheduler().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.scheduler().is_running());
        assert_eq!(service.scheduler().active_accounts(), 1);

        service.elector().resign().await;
        for _ in 0..50 {
            if !service.scheduler().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!service.scheduler().is_running());

        shutdown_tx.send(true).unwrap();
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn test_app_state_shares_components() {
        let service = service();
        let state = service.app_state();
        assert!(Arc::ptr_eq(&state.scheduler, service.scheduler()));
        assert_eq!(state.elector.role(), Role::Follower);
    }
}
