//! One-time lease store initialization.
//!
//! ```text
//! NotStarted ──► AcquiringLock ──► Synchronizing ──► Done
//!                   ▲    │
//!                   └────┘ lock busy: wait sleep_time, re-check marker
//! ```
//!
//! Exactly one host synchronizes leases for a fresh store; the others wait
//! until the initialized marker shows up. The lock carries a TTL so a host
//! that dies mid-bootstrap blocks the rest for at most `bootstrap_lock_ttl`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use super::error::{FeedError, FeedResult};
use super::lease_store::LeaseStore;
use super::metrics;
use super::observability::bootstrap_span;
use super::retry;
use super::synchronizer::PartitionSynchronizer;
use super::traits::{ChangeFeedSource, LeaseContainer};

/// Progress of a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotStarted,
    AcquiringLock,
    Synchronizing,
    Done,
}

/// Settings for the bootstrap loop.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    /// TTL of the lock document.
    pub lock_ttl: Duration,
    /// Wait between lock attempts.
    pub sleep_time: Duration,
    /// Attempts before giving up (0 = unbounded).
    pub max_attempts: usize,
}

/// Runs the partition synchronizer once per lease store lifetime.
pub struct Bootstrapper<C: LeaseContainer, S: ChangeFeedSource> {
    store: Arc<LeaseStore<C>>,
    synchronizer: Arc<PartitionSynchronizer<C, S>>,
    settings: BootstrapSettings,
    host_name: String,
}

impl<C: LeaseContainer, S: ChangeFeedSource> Bootstrapper<C, S> {
    pub fn new(
        store: Arc<LeaseStore<C>>,
        synchronizer: Arc<PartitionSynchronizer<C, S>>,
        settings: BootstrapSettings,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            synchronizer,
            settings,
            host_name: host_name.into(),
        }
    }

    /// Initialize the lease store unless some host already did.
    ///
    /// Returns `BootstrapLockUnavailable` once `max_attempts` lock attempts
    /// failed, and `Cancelled` if `cancel` fires while waiting.
    pub async fn initialize(&self, cancel: &CancellationToken) -> FeedResult<()> {
        let span = bootstrap_span(&self.host_name, self.store.marker_id());
        self.run(cancel).instrument(span).await
    }

    async fn run(&self, cancel: &CancellationToken) -> FeedResult<()> {
        let mut state = BootstrapState::NotStarted;
        let mut delays = retry::delays(retry::bootstrap_policy(
            self.settings.sleep_time,
            self.settings.max_attempts,
        ));
        let mut attempts = 0usize;

        loop {
            debug!(?state, attempts, "Bootstrap step");
            match state {
                BootstrapState::NotStarted => {
                    if self.store.is_initialized().await? {
                        metrics::record_bootstrap_event("already_initialized");
                        state = BootstrapState::Done;
                    } else {
                        state = BootstrapState::AcquiringLock;
                    }
                }
                BootstrapState::AcquiringLock => {
                    if cancel.is_cancelled() {
                        return Err(FeedError::Cancelled);
                    }
                    attempts += 1;
                    if self
                        .store
                        .acquire_initialization_lock(self.settings.lock_ttl)
                        .await?
                    {
                        metrics::record_bootstrap_event("lock_acquired");
                        state = BootstrapState::Synchronizing;
                        continue;
                    }

                    metrics::record_bootstrap_event("lock_busy");
                    let Some(delay) = delays.next() else {
                        warn!(attempts, "Giving up on the bootstrap lock");
                        return Err(FeedError::BootstrapLockUnavailable { attempts });
                    };
                    debug!(delay = ?delay, "Bootstrap lock busy, waiting");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Another host may have finished while we waited.
                    state = BootstrapState::NotStarted;
                }
                BootstrapState::Synchronizing => {
                    let result = self.synchronize().await;
                    if let Err(e) = self.store.release_initialization_lock().await {
                        warn!(error = %e, "Failed to release bootstrap lock");
                    }
                    result?;
                    state = BootstrapState::Done;
                }
                BootstrapState::Done => {
                    info!(attempts, "Lease store initialized");
                    return Ok(());
                }
            }
        }
    }

    async fn synchronize(&self) -> FeedResult<()> {
        // Re-check under the lock: the previous holder may have completed.
        if self.store.is_initialized().await? {
            return Ok(());
        }
        let created = self.synchronizer.create_missing_leases().await?;
        self.store.mark_initialized().await?;
        metrics::record_bootstrap_event("synchronized");
        info!(created, "Bootstrap synchronization complete");
        Ok(())
    }
}
