//! Checkpointing of partition progress.
//!
//! [`LeaseCheckpointer`] persists continuation tokens into the owned lease;
//! [`CheckpointTracker`] decides, per [`CheckpointFrequency`], when the
//! processor should do so automatically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::error::FeedResult;
use super::lease::Lease;
use super::lease_manager::LeaseStoreManager;
use super::traits::{LeaseContainer, PartitionCheckpointer};

/// When the processor checkpoints on its own.
///
/// The default checkpoints after every batch. Setting `document_count` or
/// `time_interval` checkpoints once either threshold is reached. With
/// `explicit` set the processor never checkpoints; the observer calls
/// [`ObserverContext::checkpoint`](super::ObserverContext::checkpoint).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointFrequency {
    /// Only checkpoint when the observer asks for it.
    pub explicit: bool,
    /// Checkpoint once this many documents were processed.
    pub document_count: Option<usize>,
    /// Checkpoint once this much time passed since the last checkpoint.
    pub time_interval: Option<Duration>,
}

impl CheckpointFrequency {
    pub fn every_batch() -> Self {
        Self::default()
    }

    pub fn every_documents(count: usize) -> Self {
        Self {
            document_count: Some(count),
            ..Self::default()
        }
    }

    pub fn every_interval(interval: Duration) -> Self {
        Self {
            time_interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn explicit_only() -> Self {
        Self {
            explicit: true,
            ..Self::default()
        }
    }
}

/// Tracks progress since the last checkpoint.
#[derive(Debug)]
pub struct CheckpointTracker {
    frequency: CheckpointFrequency,
    documents_since: usize,
    last_checkpoint: Instant,
}

impl CheckpointTracker {
    pub fn new(frequency: CheckpointFrequency) -> Self {
        Self {
            frequency,
            documents_since: 0,
            last_checkpoint: Instant::now(),
        }
    }

    /// Record a processed batch; returns true if a checkpoint is due.
    pub fn record_batch(&mut self, documents: usize) -> bool {
        self.documents_since += documents;
        if self.frequency.explicit {
            return false;
        }
        match (self.frequency.document_count, self.frequency.time_interval) {
            (None, None) => true,
            (count, interval) => {
                count.is_some_and(|c| self.documents_since >= c)
                    || interval.is_some_and(|i| self.last_checkpoint.elapsed() >= i)
            }
        }
    }

    /// Reset counters after a checkpoint was written.
    pub fn reset(&mut self) {
        self.documents_since = 0;
        self.last_checkpoint = Instant::now();
    }
}

/// Persists continuation tokens into one owned lease.
///
/// The lease copy is shared with the renewer so both write with the most
/// recent etag.
pub struct LeaseCheckpointer<C: LeaseContainer> {
    leases: Arc<LeaseStoreManager<C>>,
    lease: Arc<Mutex<Lease>>,
}

impl<C: LeaseContainer> LeaseCheckpointer<C> {
    pub fn new(leases: Arc<LeaseStoreManager<C>>, lease: Arc<Mutex<Lease>>) -> Self {
        Self { leases, lease }
    }
}

#[async_trait]
impl<C: LeaseContainer + 'static> PartitionCheckpointer for LeaseCheckpointer<C> {
    async fn checkpoint(&self, continuation: &str) -> FeedResult<()> {
        let mut lease = self.lease.lock().await;
        if lease.continuation_token.as_deref() == Some(continuation) {
            return Ok(());
        }
        let updated = self.leases.checkpoint(&lease, continuation).await?;
        debug!(
            lease_token = %updated.lease_token,
            continuation = %continuation,
            "Checkpointed"
        );
        *lease = updated;
        Ok(())
    }
}
