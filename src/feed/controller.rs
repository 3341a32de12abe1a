//! Partition controller: turns balancing decisions into running supervisors.
//!
//! One supervisor task runs per owned lease, spawned on the runtime handle
//! supplied by the host. Each supervisor's cancellation token is a child of
//! the host's token, so cancelling the host stops every partition. Task
//! handles are kept in a `DashMap` keyed by lease token; handles whose task
//! already finished are reaped lazily. When a supervisor stops, its task
//! decides what happens to the lease:
//!
//! | Outcome | Lease |
//! |---------|-------|
//! | `Shutdown`, `ObserverFailed`, `ReadFailed` | released |
//! | `LeaseLost` | left alone |
//! | `PartitionGone` | replaced by child leases, then deleted; released if that keeps failing |

use std::sync::Arc;

use async_trait::async_trait;
use backon::Retryable;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use super::checkpointer::{CheckpointTracker, LeaseCheckpointer};
use super::config::ProcessorOptions;
use super::error::{FeedError, FeedResult};
use super::lease::Lease;
use super::lease_manager::LeaseStoreManager;
use super::metrics;
use super::observability::partition_supervisor_span;
use super::processor::{PartitionProcessor, ProcessorSettings};
use super::renewer::{LeaseRenewer, RenewalState};
use super::retry;
use super::supervisor::{PartitionSupervisor, SupervisorOutcome};
use super::synchronizer::PartitionSynchronizer;
use super::traits::{
    ChangeFeedObserverFactory, ChangeFeedSource, LeaseContainer, PartitionCheckpointer,
    PartitionController,
};

struct SupervisorHandle {
    lease: Arc<Mutex<Lease>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    renewal: Arc<RenewalState>,
}

/// Default [`PartitionController`].
pub struct PartitionControllerImpl<C: LeaseContainer, S: ChangeFeedSource> {
    leases: Arc<LeaseStoreManager<C>>,
    synchronizer: Arc<PartitionSynchronizer<C, S>>,
    source: Arc<S>,
    factory: Arc<dyn ChangeFeedObserverFactory>,
    options: ProcessorOptions,
    runtime: Handle,
    cancel: CancellationToken,
    supervisors: DashMap<String, SupervisorHandle>,
}

impl<C, S> PartitionControllerImpl<C, S>
where
    C: LeaseContainer + 'static,
    S: ChangeFeedSource + 'static,
{
    pub fn new(
        leases: Arc<LeaseStoreManager<C>>,
        synchronizer: Arc<PartitionSynchronizer<C, S>>,
        source: Arc<S>,
        factory: Arc<dyn ChangeFeedObserverFactory>,
        options: ProcessorOptions,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            leases,
            synchronizer,
            source,
            factory,
            options,
            runtime,
            cancel,
            supervisors: DashMap::new(),
        }
    }

    fn reap_finished(&self) {
        self.supervisors.retain(|_, handle| !handle.task.is_finished());
        metrics::set_owned_leases(self.supervisors.len());
    }

    fn start_supervisor(&self, lease: Lease) {
        let lease_token = lease.lease_token.clone();
        let settings = ProcessorSettings::from_lease(&lease, &self.options);
        let shared = Arc::new(Mutex::new(lease));
        let renewal = Arc::new(RenewalState::new());
        let checkpointer: Arc<dyn PartitionCheckpointer> =
            Arc::new(LeaseCheckpointer::new(self.leases.clone(), shared.clone()));

        let processor = PartitionProcessor::new(
            self.source.clone(),
            settings,
            checkpointer.clone(),
            CheckpointTracker::new(self.options.checkpoint_frequency.clone()),
        );
        let renewer = LeaseRenewer::new(
            self.leases.clone(),
            shared.clone(),
            self.options.lease_renew_interval,
            renewal.clone(),
        );
        let supervisor = PartitionSupervisor::new(
            lease_token.clone(),
            processor,
            renewer,
            self.factory.create_observer(),
            checkpointer,
        );

        let cancel = self.cancel.child_token();
        let span = partition_supervisor_span(&lease_token, self.leases.host_name());
        let task = self.runtime.spawn(
            run_supervisor(
                supervisor,
                cancel.clone(),
                self.leases.clone(),
                self.synchronizer.clone(),
                shared.clone(),
            )
            .instrument(span),
        );

        info!(lease_token = %lease_token, "Started partition supervisor");
        self.supervisors.insert(
            lease_token,
            SupervisorHandle {
                lease: shared,
                cancel,
                task,
                renewal,
            },
        );
        metrics::set_owned_leases(self.supervisors.len());
    }

    async fn update_running(&self, shared: Arc<Mutex<Lease>>, lease: &Lease) -> FeedResult<()> {
        let mut current = shared.lock().await;
        if current.properties == lease.properties {
            return Ok(());
        }
        let mut desired = current.clone();
        desired.properties = lease.properties.clone();
        *current = self.leases.update_lease(&desired).await?;
        debug!(lease_token = %lease.lease_token, "Updated lease properties");
        Ok(())
    }
}

async fn run_supervisor<C, S>(
    supervisor: PartitionSupervisor<C, S>,
    cancel: CancellationToken,
    leases: Arc<LeaseStoreManager<C>>,
    synchronizer: Arc<PartitionSynchronizer<C, S>>,
    lease: Arc<Mutex<Lease>>,
) where
    C: LeaseContainer,
    S: ChangeFeedSource,
{
    let outcome = supervisor.run(&cancel).await;
    metrics::record_supervisor_exit(&outcome.close_reason().to_string());
    let current = lease.lock().await.clone();

    match &outcome {
        SupervisorOutcome::LeaseLost => {
            info!(lease_token = %current.lease_token, "Lease taken over by another host");
            return;
        }
        SupervisorOutcome::PartitionGone => {
            let replaced = (|| async { synchronizer.handle_partition_gone(&current).await })
                .retry(retry::store_policy())
                .when(FeedError::is_retriable)
                .await;
            match replaced {
                Ok(children) => {
                    info!(
                        lease_token = %current.lease_token,
                        children = children.len(),
                        "Replaced lease of retired partition"
                    );
                    return;
                }
                // Hand the lease back so any host can retry the replacement.
                Err(e) => warn!(
                    lease_token = %current.lease_token,
                    error = %e,
                    "Failed to replace lease of retired partition, releasing it"
                ),
            }
        }
        SupervisorOutcome::ObserverFailed(e) | SupervisorOutcome::ReadFailed(e) => {
            warn!(lease_token = %current.lease_token, error = %e, "Partition processing failed");
        }
        SupervisorOutcome::Shutdown => {}
    }

    if outcome.should_release() || matches!(outcome, SupervisorOutcome::PartitionGone) {
        match leases.release(&current).await {
            Ok(_) => {}
            Err(e) if e.is_lease_lost() => {
                debug!(lease_token = %current.lease_token, "Lease already gone at release");
            }
            Err(e) => warn!(lease_token = %current.lease_token, error = %e, "Failed to release lease"),
        }
    }
}

#[async_trait]
impl<C, S> PartitionController for PartitionControllerImpl<C, S>
where
    C: LeaseContainer + 'static,
    S: ChangeFeedSource + 'static,
{
    async fn initialize(&self) -> FeedResult<()> {
        let owned = self.leases.list_owned_leases().await?;
        info!(count = owned.len(), "Resuming owned leases");
        for lease in owned {
            if self.supervisors.contains_key(&lease.lease_token) {
                continue;
            }
            match self.leases.renew(&lease).await {
                Ok(renewed) => self.start_supervisor(renewed),
                Err(e) if e.is_lease_lost() => {
                    debug!(lease_token = %lease.lease_token, "Owned lease lost before resume");
                }
                Err(e) => {
                    warn!(lease_token = %lease.lease_token, error = %e, "Failed to resume lease");
                }
            }
        }
        Ok(())
    }

    async fn add_or_update_lease(&self, lease: Lease) -> FeedResult<()> {
        self.reap_finished();
        let running = self
            .supervisors
            .get(&lease.lease_token)
            .map(|handle| handle.lease.clone());
        if let Some(shared) = running {
            return self.update_running(shared, &lease).await;
        }

        let acquired = self.leases.acquire(&lease).await?;
        info!(
            lease_token = %acquired.lease_token,
            previous_owner = ?lease.owner,
            "Acquired lease"
        );
        self.start_supervisor(acquired);
        Ok(())
    }

    async fn release_expired_own_leases(&self) -> FeedResult<usize> {
        self.reap_finished();
        let expiration = self.options.lease_expiration_interval;
        let expired: Vec<String> = self
            .supervisors
            .iter()
            .filter(|entry| entry.renewal.since_last_renewal() > expiration)
            .map(|entry| entry.key().clone())
            .collect();

        for lease_token in &expired {
            warn!(lease_token = %lease_token, "Lease renewal stalled past expiration, stopping");
            self.shutdown_lease(lease_token).await?;
        }
        Ok(expired.len())
    }

    async fn shutdown_lease(&self, lease_token: &str) -> FeedResult<()> {
        let Some((_, handle)) = self.supervisors.remove(lease_token) else {
            return Ok(());
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(lease_token = %lease_token, error = %e, "Supervisor task panicked");
        }
        metrics::set_owned_leases(self.supervisors.len());
        Ok(())
    }

    async fn shutdown(&self) -> FeedResult<()> {
        let tokens: Vec<String> = self.supervisors.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<SupervisorHandle> = tokens
            .iter()
            .filter_map(|token| self.supervisors.remove(token).map(|(_, handle)| handle))
            .collect();
        info!(count = handles.len(), "Shutting down partition supervisors");

        for handle in &handles {
            handle.cancel.cancel();
        }
        for result in join_all(handles.into_iter().map(|h| h.task)).await {
            if let Err(e) = result {
                warn!(error = %e, "Supervisor task panicked");
            }
        }
        metrics::set_owned_leases(0);
        Ok(())
    }

    fn owned_lease_tokens(&self) -> Vec<String> {
        self.reap_finished();
        let mut tokens: Vec<String> = self.supervisors.iter().map(|e| e.key().clone()).collect();
        tokens.sort();
        tokens
    }
}
