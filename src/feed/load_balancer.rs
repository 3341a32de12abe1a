//! Periodic lease balancing for one host.
//!
//! Every tick lists all leases, asks the [`LoadBalancingStrategy`] which to
//! take, hands them to the [`PartitionController`] and tears down supervisors
//! whose renewal stalled. Tick failures are logged; the loop keeps running
//! until cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::error::FeedResult;
use super::lease_manager::LeaseStoreManager;
use super::metrics;
use super::observability::balancer_tick_span;
use super::retry::with_jitter;
use super::traits::{LeaseContainer, LoadBalancingStrategy, PartitionController};

pub struct PartitionLoadBalancer<C: LeaseContainer> {
    leases: Arc<LeaseStoreManager<C>>,
    controller: Arc<dyn PartitionController>,
    strategy: Arc<dyn LoadBalancingStrategy>,
    acquire_interval: Duration,
}

impl<C: LeaseContainer> PartitionLoadBalancer<C> {
    pub fn new(
        leases: Arc<LeaseStoreManager<C>>,
        controller: Arc<dyn PartitionController>,
        strategy: Arc<dyn LoadBalancingStrategy>,
        acquire_interval: Duration,
    ) -> Self {
        Self {
            leases,
            controller,
            strategy,
            acquire_interval,
        }
    }

    /// Run one balancing pass; returns the number of leases taken.
    pub async fn tick(&self) -> FeedResult<usize> {
        let all_leases = self.leases.list_leases().await?;
        let span = balancer_tick_span(self.leases.host_name(), all_leases.len());

        async {
            let candidates = self.strategy.select_leases_to_take(&all_leases);
            let taken = if candidates.is_empty() {
                0
            } else {
                debug!(candidates = candidates.len(), "Taking leases");
                self.controller.take_leases(candidates).await?
            };
            let stopped = self.controller.release_expired_own_leases().await?;
            if stopped > 0 {
                info!(stopped, "Stopped supervisors with stalled renewal");
            }
            Span::current().record("taken", taken);
            metrics::record_balancer_tick(taken);
            Ok(taken)
        }
        .instrument(span)
        .await
    }

    /// Tick immediately, then every jittered `acquire_interval` until cancelled.
    pub async fn run(&self, cancel: &CancellationToken) {
        info!(interval = ?self.acquire_interval, "Load balancer started");
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Load balancing pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(with_jitter(self.acquire_interval)) => {}
            }
        }
        info!("Load balancer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::balancing::EqualPartitionsBalancingStrategy;
    use crate::feed::config::ProcessorOptions;
    use crate::feed::controller::PartitionControllerImpl;
    use crate::feed::error::ObserverError;
    use crate::feed::memory::{InMemoryChangeFeed, InMemoryLeaseContainer};
    use crate::feed::synchronizer::PartitionSynchronizer;
    use crate::feed::traits::{ChangeFeedObserver, ChangeFeedObserverFactory, ObserverContext};
    use crate::types::Document;
    use async_trait::async_trait;
    use tokio::runtime::Handle;

    struct NoopObserver;

    #[async_trait]
    impl ChangeFeedObserver for NoopObserver {
        async fn process_changes(
            &self,
            _context: &ObserverContext,
            _documents: Vec<Document>,
        ) -> Result<(), ObserverError> {
            Ok(())
        }
    }

    struct Host {
        controller: Arc<dyn PartitionController>,
        balancer: PartitionLoadBalancer<InMemoryLeaseContainer>,
    }

    fn host(
        name: &str,
        container: &Arc<InMemoryLeaseContainer>,
        feed: &InMemoryChangeFeed,
    ) -> Host {
        let mut options = ProcessorOptions::new(name);
        options.lease_renew_interval = Duration::from_millis(100);
        options.lease_expiration_interval = Duration::from_secs(1);
        options.lease_acquire_interval = Duration::from_millis(200);

        let leases = Arc::new(LeaseStoreManager::new(container.clone(), "", "coll", name));
        let source = Arc::new(feed.clone());
        let factory: Arc<dyn ChangeFeedObserverFactory> = Arc::new(|| NoopObserver);
        let controller: Arc<dyn PartitionController> = Arc::new(PartitionControllerImpl::new(
            leases.clone(),
            Arc::new(PartitionSynchronizer::new(source.clone(), leases.clone())),
            source,
            factory,
            options.clone(),
            Handle::current(),
            CancellationToken::new(),
        ));
        let balancer = PartitionLoadBalancer::new(
            leases,
            controller.clone(),
            Arc::new(EqualPartitionsBalancingStrategy::from_options(&options)),
            options.lease_acquire_interval,
        );
        Host {
            controller,
            balancer,
        }
    }

    async fn seeded(partitions: usize) -> (Arc<InMemoryLeaseContainer>, InMemoryChangeFeed) {
        let container = Arc::new(InMemoryLeaseContainer::new());
        let feed = InMemoryChangeFeed::with_partitions("coll", partitions).await;
        let leases = Arc::new(LeaseStoreManager::new(container.clone(), "", "coll", "seed"));
        PartitionSynchronizer::new(Arc::new(feed.clone()), leases)
            .create_missing_leases()
            .await
            .unwrap();
        (container, feed)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_host_takes_everything() {
        let (container, feed) = seeded(3).await;
        let a = host("a", &container, &feed);
        assert_eq!(a.balancer.tick().await.unwrap(), 3);
        assert_eq!(a.controller.owned_lease_tokens(), vec!["0", "1", "2"]);
        assert_eq!(a.balancer.tick().await.unwrap(), 0);
        a.controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_host_steals_half() {
        let (container, feed) = seeded(4).await;
        let a = host("a", &container, &feed);
        let b = host("b", &container, &feed);
        a.balancer.tick().await.unwrap();

        assert_eq!(b.balancer.tick().await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.controller.owned_lease_tokens().len(), 2);
        assert_eq!(b.controller.owned_lease_tokens().len(), 2);

        a.controller.shutdown().await.unwrap();
        b.controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let (container, feed) = seeded(2).await;
        let a = host("a", &container, &feed);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            stopper.cancel();
        });
        a.balancer.run(&cancel).await;
        assert_eq!(a.controller.owned_lease_tokens().len(), 2);
        a.controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_error_keeps_loop_alive() {
        let (container, feed) = seeded(1).await;
        let a = host("a", &container, &feed);
        container.set_unavailable(true);
        assert!(a.balancer.tick().await.is_err());

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let flaky = container.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flaky.set_unavailable(false);
            tokio::time::sleep(Duration::from_millis(500)).await;
            stopper.cancel();
        });
        a.balancer.run(&cancel).await;
        assert_eq!(a.controller.owned_lease_tokens(), vec!["0"]);
        a.controller.shutdown().await.unwrap();
    }
}
