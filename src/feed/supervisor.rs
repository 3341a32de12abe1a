//! Runs one owned lease: observer lifecycle, processing and renewal.
//!
//! The processor and the renewer run concurrently under a child token of the
//! caller's cancellation token. Whichever stops first cancels the other, so
//! a lost lease stops processing and a terminated processor stops renewal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{FeedError, FeedResult};
use super::processor::PartitionProcessor;
use super::renewer::LeaseRenewer;
use super::traits::{
    ChangeFeedObserver, ChangeFeedSource, CloseReason, LeaseContainer, ObserverContext,
    PartitionCheckpointer,
};

/// How a supervisor finished; drives what the controller does with the lease.
#[derive(Debug)]
pub enum SupervisorOutcome {
    /// Cancelled by the host. The lease should be released.
    Shutdown,
    /// Another host owns the lease. Nothing to release.
    LeaseLost,
    /// The partition split or vanished. Child leases must be created.
    PartitionGone,
    /// The observer failed to open or process a batch.
    ObserverFailed(FeedError),
    /// Reading the feed failed with an unrecoverable error.
    ReadFailed(FeedError),
}

impl SupervisorOutcome {
    /// Reason passed to the observer's `close`.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            SupervisorOutcome::Shutdown => CloseReason::Shutdown,
            SupervisorOutcome::LeaseLost => CloseReason::LeaseLost,
            SupervisorOutcome::PartitionGone => CloseReason::LeaseGone,
            SupervisorOutcome::ObserverFailed(_) => CloseReason::ObserverError,
            SupervisorOutcome::ReadFailed(_) => CloseReason::ReadError,
        }
    }

    /// Returns true if the lease should be released afterwards.
    pub fn should_release(&self) -> bool {
        matches!(
            self,
            SupervisorOutcome::Shutdown
                | SupervisorOutcome::ObserverFailed(_)
                | SupervisorOutcome::ReadFailed(_)
        )
    }

    fn from_results(processed: FeedResult<()>, renewed: FeedResult<()>) -> Self {
        if let Err(e) = &renewed
            && e.is_lease_lost()
        {
            return SupervisorOutcome::LeaseLost;
        }
        match processed {
            Ok(()) => SupervisorOutcome::Shutdown,
            Err(e) if e.is_lease_lost() => SupervisorOutcome::LeaseLost,
            Err(e) if e.is_partition_gone() => SupervisorOutcome::PartitionGone,
            Err(e @ FeedError::Observer { .. }) => SupervisorOutcome::ObserverFailed(e),
            Err(e) => SupervisorOutcome::ReadFailed(e),
        }
    }
}

/// Owns the per-lease tasks for as long as this host processes the lease.
pub struct PartitionSupervisor<C: LeaseContainer, S: ChangeFeedSource> {
    lease_token: String,
    processor: PartitionProcessor<S>,
    renewer: LeaseRenewer<C>,
    observer: Box<dyn ChangeFeedObserver>,
    checkpointer: Arc<dyn PartitionCheckpointer>,
}

impl<C: LeaseContainer, S: ChangeFeedSource> PartitionSupervisor<C, S> {
    pub fn new(
        lease_token: impl Into<String>,
        processor: PartitionProcessor<S>,
        renewer: LeaseRenewer<C>,
        observer: Box<dyn ChangeFeedObserver>,
        checkpointer: Arc<dyn PartitionCheckpointer>,
    ) -> Self {
        Self {
            lease_token: lease_token.into(),
            processor,
            renewer,
            observer,
            checkpointer,
        }
    }

    /// Open the observer, process until something stops us, then close it.
    pub async fn run(self, cancel: &CancellationToken) -> SupervisorOutcome {
        let Self {
            lease_token,
            mut processor,
            renewer,
            observer,
            checkpointer,
        } = self;
        let context = ObserverContext::new(lease_token.clone(), None, checkpointer);

        if let Err(e) = observer.open(&context).await {
            warn!(lease_token = %lease_token, error = %e, "Observer failed to open");
            let outcome = SupervisorOutcome::ObserverFailed(FeedError::Observer {
                lease_token: lease_token.clone(),
                message: e.to_string(),
            });
            observer.close(&context, outcome.close_reason()).await;
            return outcome;
        }
        debug!(lease_token = %lease_token, "Observer opened");

        let child = cancel.child_token();
        let processing = async {
            let result = processor.run(&child, observer.as_ref()).await;
            child.cancel();
            result
        };
        let renewing = async {
            let result = renewer.run(&child).await;
            child.cancel();
            result
        };
        let (processed, renewed) = tokio::join!(processing, renewing);

        let outcome = SupervisorOutcome::from_results(processed, renewed);
        let reason = outcome.close_reason();
        info!(lease_token = %lease_token, reason = %reason, "Partition supervisor stopped");
        observer.close(&context, reason).await;
        outcome
    }
}
