//! Host-level entry point: bootstrap, resume, then balance until stopped.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ── start() ──► Starting ──► Running ── stop() ──► Uninitialized
//!                               │
//!                               ├─ bootstrap the lease store (once per store)
//!                               ├─ resume leases this host already owns
//!                               └─ spawn the load balancer loop
//! ```
//!
//! `start()` on a starting or running manager fails with `AlreadyRunning`;
//! `stop()` on a stopped manager does nothing. Stopping a running manager
//! cancels the balancer, then shuts down every supervisor, which releases its
//! lease. Stopping a starting manager cancels the bootstrap wait; the pending
//! `start()` then cleans up and returns `Cancelled`.
//!
//! Every task of the manager runs under one cancellation token. It is a
//! child of the token given to [`PartitionManagerBuilder::with_shutdown_token`]
//! and is cancelled when the manager is dropped.

use std::sync::Arc;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::balancing::EqualPartitionsBalancingStrategy;
use super::bootstrapper::{BootstrapSettings, Bootstrapper};
use super::config::ProcessorOptions;
use super::controller::PartitionControllerImpl;
use super::error::{FeedError, FeedResult};
use super::health::{HealthMonitor, HealthMonitoringPartitionController, TracingHealthMonitor};
use super::lease::LeaseState;
use super::lease_manager::LeaseStoreManager;
use super::lease_store::LeaseStore;
use super::load_balancer::PartitionLoadBalancer;
use super::synchronizer::PartitionSynchronizer;
use super::traits::{
    ChangeFeedObserverFactory, ChangeFeedSource, LeaseContainer, LoadBalancingStrategy,
    PartitionController,
};

/// Handles owned while the manager runs.
pub struct RunningHandle {
    cancel: CancellationToken,
    balancer: JoinHandle<()>,
}

/// Whether the manager is running.
pub enum ManagerState {
    Uninitialized,
    /// Bootstrapping; the token cancels the bootstrap wait.
    Starting(CancellationToken),
    Running(RunningHandle),
}

/// Builder for [`PartitionManager`].
pub struct PartitionManagerBuilder<C: LeaseContainer, S: ChangeFeedSource> {
    container: Arc<C>,
    source: Arc<S>,
    factory: Arc<dyn ChangeFeedObserverFactory>,
    options: ProcessorOptions,
    strategy: Option<Arc<dyn LoadBalancingStrategy>>,
    monitor: Option<Arc<dyn HealthMonitor>>,
    runtime: Option<Handle>,
    shutdown: Option<CancellationToken>,
}

impl<C, S> PartitionManagerBuilder<C, S>
where
    C: LeaseContainer + 'static,
    S: ChangeFeedSource + 'static,
{
    /// Replace the default equal-partitions strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn LoadBalancingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Replace the default tracing health monitor.
    pub fn with_health_monitor(mut self, monitor: Arc<dyn HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Runtime that partition tasks are spawned on. Defaults to the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Process-wide token; cancelling it stops the balancer and every partition.
    pub fn with_shutdown_token(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Validate the options and wire the components together.
    pub fn build(self) -> FeedResult<PartitionManager<C, S>> {
        self.options
            .validate()
            .map_err(|errors| FeedError::Config(errors.join("; ")))?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| FeedError::Config(e.to_string()))?,
        };
        let options = self.options;
        let host_name = options.host_name.clone();
        let cancel = match self.shutdown {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let store = Arc::new(LeaseStore::new(
            self.container.clone(),
            &options.lease_prefix,
            host_name.clone(),
        ));
        let leases = Arc::new(LeaseStoreManager::new(
            self.container,
            &options.lease_prefix,
            self.source.collection_id(),
            host_name,
        ));
        let synchronizer = Arc::new(PartitionSynchronizer::new(
            self.source.clone(),
            leases.clone(),
        ));
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(TracingHealthMonitor));
        let controller: Arc<dyn PartitionController> =
            Arc::new(HealthMonitoringPartitionController::new(
                PartitionControllerImpl::new(
                    leases.clone(),
                    synchronizer.clone(),
                    self.source,
                    self.factory,
                    options.clone(),
                    runtime.clone(),
                    cancel.clone(),
                ),
                monitor,
            ));
        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(EqualPartitionsBalancingStrategy::from_options(&options)));

        Ok(PartitionManager {
            options,
            store,
            leases,
            synchronizer,
            controller,
            strategy,
            runtime,
            cancel,
            state: Mutex::new(ManagerState::Uninitialized),
        })
    }
}

/// Distributes the partitions of one change feed across cooperating hosts.
pub struct PartitionManager<C: LeaseContainer, S: ChangeFeedSource> {
    options: ProcessorOptions,
    store: Arc<LeaseStore<C>>,
    leases: Arc<LeaseStoreManager<C>>,
    synchronizer: Arc<PartitionSynchronizer<C, S>>,
    controller: Arc<dyn PartitionController>,
    strategy: Arc<dyn LoadBalancingStrategy>,
    runtime: Handle,
    cancel: CancellationToken,
    state: Mutex<ManagerState>,
}

impl<C: LeaseContainer, S: ChangeFeedSource> Drop for PartitionManager<C, S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<C, S> PartitionManager<C, S>
where
    C: LeaseContainer + 'static,
    S: ChangeFeedSource + 'static,
{
    pub fn builder(
        container: Arc<C>,
        source: Arc<S>,
        factory: Arc<dyn ChangeFeedObserverFactory>,
        options: ProcessorOptions,
    ) -> PartitionManagerBuilder<C, S> {
        PartitionManagerBuilder {
            container,
            source,
            factory,
            options,
            strategy: None,
            monitor: None,
            runtime: None,
            shutdown: None,
        }
    }

    /// Manager with the default strategy and health monitor on the current runtime.
    pub fn new(
        container: Arc<C>,
        source: Arc<S>,
        factory: Arc<dyn ChangeFeedObserverFactory>,
        options: ProcessorOptions,
    ) -> FeedResult<Self> {
        Self::builder(container, source, factory, options).build()
    }

    pub fn host_name(&self) -> &str {
        &self.options.host_name
    }

    /// Bootstrap the lease store, resume owned leases and start balancing.
    ///
    /// Returns `Cancelled` if `stop()` is called before startup completes.
    pub async fn start(&self) -> FeedResult<()> {
        let cancel = {
            let mut state = self.state.lock().await;
            if !matches!(*state, ManagerState::Uninitialized) {
                return Err(FeedError::AlreadyRunning);
            }
            let cancel = self.cancel.child_token();
            *state = ManagerState::Starting(cancel.clone());
            cancel
        };

        // The state lock is not held here so stop() can reach the token.
        let resumed = self.bootstrap_and_resume(&cancel).await;

        let mut state = self.state.lock().await;
        if let Err(e) = resumed {
            *state = ManagerState::Uninitialized;
            if cancel.is_cancelled() {
                self.controller.shutdown().await?;
            }
            return Err(e);
        }
        if cancel.is_cancelled() {
            let shutdown = self.controller.shutdown().await;
            *state = ManagerState::Uninitialized;
            shutdown?;
            return Err(FeedError::Cancelled);
        }

        let balancer = PartitionLoadBalancer::new(
            self.leases.clone(),
            self.controller.clone(),
            self.strategy.clone(),
            self.options.lease_acquire_interval,
        );
        let token = cancel.clone();
        let task = self
            .runtime
            .spawn(async move { balancer.run(&token).await });

        *state = ManagerState::Running(RunningHandle {
            cancel,
            balancer: task,
        });
        info!(host = %self.options.host_name, "Partition manager started");
        Ok(())
    }

    async fn bootstrap_and_resume(&self, cancel: &CancellationToken) -> FeedResult<()> {
        let bootstrapper = Bootstrapper::new(
            self.store.clone(),
            self.synchronizer.clone(),
            BootstrapSettings {
                lock_ttl: self.options.bootstrap_lock_ttl,
                sleep_time: self.options.bootstrap_sleep_time,
                max_attempts: self.options.bootstrap_max_attempts,
            },
            self.options.host_name.clone(),
        );
        bootstrapper.initialize(cancel).await?;
        if cancel.is_cancelled() {
            return Err(FeedError::Cancelled);
        }
        self.controller.initialize().await
    }

    /// Stop balancing and release every owned lease. A no-op when stopped.
    pub async fn stop(&self) -> FeedResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, ManagerState::Uninitialized) {
            ManagerState::Uninitialized => Ok(()),
            ManagerState::Starting(cancel) => {
                // The pending start() sees the cancellation and resets the state.
                cancel.cancel();
                *state = ManagerState::Starting(cancel);
                info!(host = %self.options.host_name, "Cancelled partition manager start");
                Ok(())
            }
            ManagerState::Running(handle) => {
                handle.cancel.cancel();
                if let Err(e) = handle.balancer.await {
                    warn!(error = %e, "Load balancer task panicked");
                }
                self.controller.shutdown().await?;
                info!(host = %self.options.host_name, "Partition manager stopped");
                Ok(())
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ManagerState::Running(_))
    }

    /// Tokens of the leases this host currently processes.
    pub fn owned_lease_tokens(&self) -> Vec<String> {
        self.controller.owned_lease_tokens()
    }

    /// Owner, continuation and last renewal of every lease.
    pub async fn lease_states(&self) -> FeedResult<Vec<LeaseState>> {
        let now = Utc::now();
        let expiration = self.options.lease_expiration_interval;
        Ok(self
            .leases
            .list_leases()
            .await?
            .iter()
            .map(|lease| lease.state_at(now, expiration))
            .collect())
    }
}
