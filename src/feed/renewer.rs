//! Keeps an owned lease alive while its partition is processed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::FeedResult;
use super::lease::Lease;
use super::lease_manager::LeaseStoreManager;
use super::traits::LeaseContainer;

/// Time of the last successful renewal, shared with the controller.
#[derive(Debug)]
pub struct RenewalState {
    origin: Instant,
    last_renewed_ms: AtomicU64,
}

impl RenewalState {
    /// A state that counts "now" as the last renewal.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_renewed_ms: AtomicU64::new(0),
        }
    }

    pub fn mark_renewed(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_renewed_ms.store(elapsed, Ordering::SeqCst);
    }

    /// Time since the last successful renewal.
    pub fn since_last_renewal(&self) -> Duration {
        let last = Duration::from_millis(self.last_renewed_ms.load(Ordering::SeqCst));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for RenewalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically renews one lease until cancelled or the lease is lost.
pub struct LeaseRenewer<C: LeaseContainer> {
    leases: Arc<LeaseStoreManager<C>>,
    lease: Arc<Mutex<Lease>>,
    renew_interval: Duration,
    state: Arc<RenewalState>,
}

impl<C: LeaseContainer> LeaseRenewer<C> {
    pub fn new(
        leases: Arc<LeaseStoreManager<C>>,
        lease: Arc<Mutex<Lease>>,
        renew_interval: Duration,
        state: Arc<RenewalState>,
    ) -> Self {
        Self {
            leases,
            lease,
            renew_interval,
            state,
        }
    }

    /// Run until `cancel` fires (`Ok`) or the lease is lost (`Err(LeaseLost)`).
    ///
    /// Other renewal failures are logged and retried on the next interval.
    pub async fn run(&self, cancel: &CancellationToken) -> FeedResult<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.renew_interval) => {}
            }
            if let Err(e) = self.renew().await {
                if e.is_lease_lost() {
                    warn!(error = %e, "Lease lost during renewal");
                    return Err(e);
                }
                warn!(error = %e, "Lease renewal failed, will retry");
            }
        }
    }

    async fn renew(&self) -> FeedResult<()> {
        let mut lease = self.lease.lock().await;
        let renewed = self.leases.renew(&lease).await?;
        debug!(lease_token = %renewed.lease_token, "Renewed lease");
        *lease = renewed;
        self.state.mark_renewed();
        Ok(())
    }
}
