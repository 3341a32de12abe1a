//! Traits at the seams of the engine.
//!
//! These traits abstract the two external collaborators and the pluggable
//! parts of the engine, allowing for:
//! - Different backends (a document database, the in-memory test doubles)
//! - Custom load balancing strategies
//! - Decorating the partition controller (health monitoring)
//!
//! # Available Implementations
//!
//! - [`InMemoryLeaseContainer`](super::InMemoryLeaseContainer) and
//!   [`InMemoryChangeFeed`](super::InMemoryChangeFeed): in-memory collaborators for testing
//! - [`EqualPartitionsBalancingStrategy`](super::EqualPartitionsBalancingStrategy): default strategy
//! - [`PartitionControllerImpl`](super::PartitionControllerImpl) and
//!   [`HealthMonitoringPartitionController`](super::HealthMonitoringPartitionController)
//!
//! # Trait Hierarchy
//!
//! - [`LeaseContainer`]: conditional document CRUD with TTL expiry
//! - [`ChangeFeedSource`]: partition listing and page reads
//! - [`ChangeFeedObserver`] / [`ChangeFeedObserverFactory`]: user callbacks
//! - [`PartitionCheckpointer`]: persists progress for one lease
//! - [`LoadBalancingStrategy`]: pure lease selection
//! - [`PartitionController`]: acquisition and supervisor lifecycle

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::error::{FeedResult, ObserverError};
use super::lease::Lease;
use crate::types::{ChangeFeedPage, ChangeFeedRequest, Document, PartitionRange};

/// A document as held by the lease container.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Primary key.
    pub id: String,
    /// Version assigned by the container on every write. Ignored on create.
    pub etag: String,
    /// Document body.
    pub body: serde_json::Value,
    /// Time-to-live counted from the last write; `None` never expires.
    pub ttl: Option<Duration>,
}

impl StoredDocument {
    /// Create a document without TTL.
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            etag: String::new(),
            body,
            ttl: None,
        }
    }

    /// Set a time-to-live on the document.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Document store holding leases and the bootstrap marker/lock documents.
///
/// Expired documents (TTL elapsed) must be invisible to every operation.
#[async_trait]
pub trait LeaseContainer: Send + Sync {
    /// Create a document if no live document has the same id.
    ///
    /// Returns the stored document with its new etag, or
    /// `FeedError::AlreadyExists` if the id is taken.
    async fn create_if_absent(&self, document: StoredDocument) -> FeedResult<StoredDocument>;

    /// Read a document by id.
    async fn read(&self, id: &str) -> FeedResult<Option<StoredDocument>>;

    /// Replace a document if its current etag equals `if_match`.
    ///
    /// Returns `FeedError::PreconditionFailed` on etag mismatch and
    /// `FeedError::NotFound` if the document does not exist.
    async fn replace(&self, document: StoredDocument, if_match: &str)
    -> FeedResult<StoredDocument>;

    /// Delete a document, optionally only if its etag equals `if_match`.
    ///
    /// Returns `Ok(false)` if the document did not exist and
    /// `FeedError::PreconditionFailed` on etag mismatch.
    async fn delete(&self, id: &str, if_match: Option<&str>) -> FeedResult<bool>;

    /// List live documents whose id starts with `id_prefix`.
    async fn list(&self, id_prefix: &str) -> FeedResult<Vec<StoredDocument>>;
}

/// The change-feed data source for one monitored collection.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Identifier of the monitored collection, used in lease ids.
    fn collection_id(&self) -> &str;

    /// List the current partition key ranges of the collection.
    async fn list_partition_ranges(&self) -> FeedResult<Vec<PartitionRange>>;

    /// Read one page of changes.
    ///
    /// Raises classified errors: `Throttled`, `PageTooLarge`,
    /// `PartitionSplit`, `PartitionNotFound`, or `Source` for anything else.
    async fn query_changes(&self, request: &ChangeFeedRequest) -> FeedResult<ChangeFeedPage>;

    /// Pick the continuation that is earliest in feed order.
    ///
    /// Used to seed a merged partition from several parents without skipping
    /// changes. A parent that never checkpointed (`None`) wins. The default
    /// compares tokens numerically when they all parse as integers and
    /// lexicographically otherwise.
    fn earliest_continuation(&self, tokens: &[Option<String>]) -> Option<String> {
        if tokens.iter().any(Option::is_none) {
            return None;
        }
        tokens
            .iter()
            .flatten()
            .min_by(|a, b| compare_continuations(a, b))
            .cloned()
    }
}

/// Compare two continuation tokens in feed order.
pub fn compare_continuations(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Persists progress for one lease.
#[async_trait]
pub trait PartitionCheckpointer: Send + Sync {
    /// Persist `continuation` into the owned lease.
    ///
    /// Fails with `FeedError::LeaseLost` if the lease changed hands.
    async fn checkpoint(&self, continuation: &str) -> FeedResult<()>;
}

/// Why an observer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The host is shutting down or the lease is being handed over.
    Shutdown,
    /// Another host took the lease.
    LeaseLost,
    /// The partition split or vanished.
    LeaseGone,
    /// The observer returned an error.
    ObserverError,
    /// Reading the feed failed with an unclassified error.
    ReadError,
    /// Anything else.
    Unknown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::LeaseLost => write!(f, "lease_lost"),
            CloseReason::LeaseGone => write!(f, "lease_gone"),
            CloseReason::ObserverError => write!(f, "observer_error"),
            CloseReason::ReadError => write!(f, "read_error"),
            CloseReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Context handed to observer callbacks.
#[derive(Clone)]
pub struct ObserverContext {
    lease_token: String,
    continuation: Option<String>,
    checkpointer: Arc<dyn PartitionCheckpointer>,
}

impl ObserverContext {
    pub(crate) fn new(
        lease_token: impl Into<String>,
        continuation: Option<String>,
        checkpointer: Arc<dyn PartitionCheckpointer>,
    ) -> Self {
        Self {
            lease_token: lease_token.into(),
            continuation,
            checkpointer,
        }
    }

    /// Partition token of the lease being processed.
    pub fn lease_token(&self) -> &str {
        &self.lease_token
    }

    /// Continuation that follows the batch being processed, if any.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Checkpoint the continuation that follows the current batch.
    ///
    /// A no-op outside of `process_changes`.
    pub async fn checkpoint(&self) -> FeedResult<()> {
        match &self.continuation {
            Some(continuation) => self.checkpointer.checkpoint(continuation).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ObserverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverContext")
            .field("lease_token", &self.lease_token)
            .field("continuation", &self.continuation)
            .finish()
    }
}

/// Caller-supplied handler invoked with each batch of changes of a partition.
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync {
    /// Called once when processing of a lease starts.
    async fn open(&self, _context: &ObserverContext) -> Result<(), ObserverError> {
        Ok(())
    }

    /// Handle one batch of changes, in feed order.
    async fn process_changes(
        &self,
        context: &ObserverContext,
        documents: Vec<Document>,
    ) -> Result<(), ObserverError>;

    /// Called once when processing of a lease stops.
    async fn close(&self, _context: &ObserverContext, _reason: CloseReason) {}
}

/// Creates one observer per owned lease.
pub trait ChangeFeedObserverFactory: Send + Sync {
    /// Create a new observer instance.
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver>;
}

impl<F, O> ChangeFeedObserverFactory for F
where
    F: Fn() -> O + Send + Sync,
    O: ChangeFeedObserver + 'static,
{
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver> {
        Box::new(self())
    }
}

/// Decides which leases this host should try to acquire next.
pub trait LoadBalancingStrategy: Send + Sync {
    /// Pure selection over a snapshot of every lease.
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease>;
}

/// Executes acquisition and release decisions for one host.
#[async_trait]
pub trait PartitionController: Send + Sync {
    /// Resume processing of leases this host already owns.
    async fn initialize(&self) -> FeedResult<()>;

    /// Acquire `lease` and start processing it, or refresh it if already running.
    async fn add_or_update_lease(&self, lease: Lease) -> FeedResult<()>;

    /// Try every candidate; leases lost to contention are skipped.
    ///
    /// Returns how many candidates are now processed by this host.
    async fn take_leases(&self, candidates: Vec<Lease>) -> FeedResult<usize> {
        let mut taken = 0;
        for lease in candidates {
            let lease_token = lease.lease_token.clone();
            match self.add_or_update_lease(lease).await {
                Ok(()) => taken += 1,
                Err(e) if e.is_lease_lost() => {}
                Err(e) => {
                    warn!(lease_token = %lease_token, error = %e, "Failed to take lease");
                }
            }
        }
        Ok(taken)
    }

    /// Tear down supervisors whose lease renewal has stopped succeeding.
    ///
    /// Returns the number of supervisors torn down.
    async fn release_expired_own_leases(&self) -> FeedResult<usize>;

    /// Stop processing a lease and release it.
    async fn shutdown_lease(&self, lease_token: &str) -> FeedResult<()>;

    /// Stop processing every lease and release them.
    async fn shutdown(&self) -> FeedResult<()>;

    /// Tokens of the leases currently processed by this host.
    fn owned_lease_tokens(&self) -> Vec<String>;
}
