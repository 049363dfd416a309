use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::item::WorkKind;
use crate::leader::{LeaderElector, LeaderLock, LockStore};
use crate::lease::LeaseManager;
use crate::priority::PriorityResolver;
use crate::refresh::{Eligibility, RefreshScheduler, ViewRefresher};
use crate::store::{SourceStore, ViewStore};

/// One server instance: lease operations for request handlers, plus the
/// refresh jobs it runs whenever it wins the leader lock.
pub struct Node {
    pub config: QueueConfig,
    pub source: Arc<dyn SourceStore>,
    pub views: Arc<dyn ViewStore>,
    pub lock_store: Arc<dyn LockStore>,
    pub priorities: Arc<PriorityResolver>,
    pub lease_manager: LeaseManager,
    pub dashboard_addr: Option<SocketAddr>,
    eligibility: HashMap<WorkKind, Eligibility>,
}

impl Node {
    pub fn new(
        config: QueueConfig,
        source: Arc<dyn SourceStore>,
        views: Arc<dyn ViewStore>,
        lock_store: Arc<dyn LockStore>,
        priorities: PriorityResolver,
        dashboard_addr: Option<SocketAddr>,
    ) -> Result<Self> {
        config.validate()?;
        let lease_manager = LeaseManager::new(source.clone(), views.clone(), &config)?;

        Ok(Self {
            config,
            source,
            views,
            lock_store,
            priorities: Arc::new(priorities),
            lease_manager,
            dashboard_addr,
            eligibility: HashMap::new(),
        })
    }

    pub fn with_eligibility(mut self, kind: WorkKind, eligibility: Eligibility) -> Self {
        self.eligibility.insert(kind, eligibility);
        self
    }

    /// Run the node until `shutdown` fires.
    ///
    /// 1. Spawns the leader elector (acquire/renew loop)
    /// 2. Spawns the refresh scheduler, gated on leadership
    /// 3. Optionally spawns the dashboard
    /// 4. On shutdown, stops the refresh timers, then relinquishes the lock
    ///
    /// # Errors
    ///
    /// Returns an error if a refresher cannot be built from the configuration.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (elector, leadership) =
            LeaderElector::new(self.lock_store.clone(), self.config.leader.clone());

        let mut scheduler = RefreshScheduler::new(leadership.clone());
        for kind in WorkKind::ALL {
            let refresher = ViewRefresher::new(
                kind,
                self.source.clone(),
                self.views.clone(),
                self.priorities.clone(),
                self.config.refresh(kind).clone(),
                self.config.staleness_bound,
            )?
            .with_eligibility(
                self.eligibility
                    .get(&kind)
                    .cloned()
                    .unwrap_or_else(Eligibility::any),
            );
            scheduler = scheduler.with_job(refresher);
        }

        // Separate tokens so the scheduler is fully stopped before the lock goes.
        let scheduler_shutdown = CancellationToken::new();
        let elector_shutdown = CancellationToken::new();

        let elector_handle = tokio::spawn(elector.run(elector_shutdown.clone()));
        let scheduler_handle = tokio::spawn(scheduler.run(scheduler_shutdown.clone()));

        if let Some(dashboard_addr) = self.dashboard_addr {
            let dashboard_state = DashboardState {
                leadership: leadership.clone(),
                lock: LeaderLock::new(self.lock_store.clone(), self.config.leader.clone()),
                lease_manager: self.lease_manager.clone(),
            };
            let dashboard_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(dashboard_addr, dashboard_state, dashboard_shutdown).await;
            });
        }

        tracing::info!(holder_id = %self.config.leader.holder_id, "Node running");
        shutdown.cancelled().await;
        tracing::info!("Shutting down, stopping refresh jobs");

        scheduler_shutdown.cancel();
        if let Err(e) = scheduler_handle.await {
            tracing::error!(error = %e, "Refresh scheduler task failed");
        }

        elector_shutdown.cancel();
        if let Err(e) = elector_handle.await {
            tracing::error!(error = %e, "Leader elector task failed");
        }

        tracing::info!("Node stopped");
        Ok(())
    }
}
