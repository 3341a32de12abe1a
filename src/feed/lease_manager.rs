//! CRUD over lease documents with optimistic concurrency.
//!
//! Every mutation is a read-modify-write conditional on the etag the lease
//! was read at. On an etag conflict the manager re-reads the lease and
//! re-applies the mutation to the fresh document, up to
//! [`LEASE_CONFLICT_RETRY_COUNT`] times. Each mutation carries its own
//! ownership check, evaluated against the fresh document:
//!
//! | Operation | Requires |
//! |-----------|----------|
//! | `acquire` | stored owner equals the owner observed when the lease was selected |
//! | `renew`, `release`, `checkpoint` | stored owner is this host |
//! | `update_lease` | stored owner equals the caller's copy |
//!
//! A failed check, or a lease that disappeared, surfaces as
//! [`FeedError::LeaseLost`]. Conflicts caused by this host's own renewer and
//! checkpointer racing each other are therefore absorbed, while a change of
//! ownership is not.

use std::sync::Arc;

use backon::Retryable;
use chrono::Utc;
use tracing::{Instrument, debug, info, warn};

use super::error::{FeedError, FeedResult};
use super::lease::Lease;
use super::metrics;
use super::observability::{LeaseOperation, lease_operation_span};
use super::retry;
use super::traits::{LeaseContainer, StoredDocument};
use crate::constants::{LEASE_CONFLICT_RETRY_COUNT, LEASE_ID_SEPARATOR};
use crate::types::PartitionRange;

/// Lease CRUD for one host, one lease prefix and one monitored collection.
pub struct LeaseStoreManager<C: LeaseContainer> {
    container: Arc<C>,
    host_name: String,
    id_prefix: String,
}

impl<C: LeaseContainer> LeaseStoreManager<C> {
    /// Create a manager for leases of `collection_id` stored under `lease_prefix`.
    pub fn new(
        container: Arc<C>,
        lease_prefix: &str,
        collection_id: &str,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            container,
            host_name: host_name.into(),
            id_prefix: format!("{}{}{}", lease_prefix, collection_id, LEASE_ID_SEPARATOR),
        }
    }

    /// Identity written into `owner` by this manager.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Document id of the lease for a partition token.
    pub fn lease_id(&self, lease_token: &str) -> String {
        format!("{}{}", self.id_prefix, lease_token)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// List every lease of the collection.
    pub async fn list_leases(&self) -> FeedResult<Vec<Lease>> {
        let documents = (|| async { self.container.list(&self.id_prefix).await })
            .retry(retry::store_policy())
            .when(|e| matches!(e, FeedError::Store(_)))
            .await?;

        documents
            .into_iter()
            .filter(|d| self.is_lease_document(d))
            .map(Lease::from_document)
            .collect()
    }

    /// A lease document's id is exactly the id derived from its own token.
    ///
    /// Store documents of another lease prefix can share the id prefix
    /// (`"{prefix}{collection}.."` followed by `.info`) and are skipped.
    fn is_lease_document(&self, document: &StoredDocument) -> bool {
        document
            .id
            .strip_prefix(&self.id_prefix)
            .is_some_and(|token| document.body["leaseToken"].as_str() == Some(token))
    }

    /// List the leases currently owned by this host.
    pub async fn list_owned_leases(&self) -> FeedResult<Vec<Lease>> {
        Ok(self
            .list_leases()
            .await?
            .into_iter()
            .filter(|l| l.is_owned_by(&self.host_name))
            .collect())
    }

    /// Read the lease of a partition token.
    pub async fn get_lease(&self, lease_token: &str) -> FeedResult<Option<Lease>> {
        self.read_lease(&self.lease_id(lease_token)).await
    }

    async fn read_lease(&self, id: &str) -> FeedResult<Option<Lease>> {
        let document = (|| async { self.container.read(id).await })
            .retry(retry::store_policy())
            .when(|e| matches!(e, FeedError::Store(_)))
            .await?;
        document.map(Lease::from_document).transpose()
    }

    // =========================================================================
    // Creation and deletion
    // =========================================================================

    /// Create an unowned lease for a partition range.
    ///
    /// Returns `None` if a lease for the partition already exists.
    pub async fn create_lease_if_not_exist(
        &self,
        range: &PartitionRange,
        continuation_token: Option<String>,
    ) -> FeedResult<Option<Lease>> {
        let lease = Lease::new(
            self.lease_id(&range.id),
            range.id.clone(),
            range.feed_range.clone(),
            continuation_token,
        );
        match self.container.create_if_absent(lease.to_document()?).await {
            Ok(stored) => {
                info!(
                    lease_token = %range.id,
                    feed_range = %range.feed_range,
                    continuation = ?lease.continuation_token,
                    "Created lease"
                );
                Lease::from_document(stored).map(Some)
            }
            Err(FeedError::AlreadyExists { .. }) => {
                debug!(lease_token = %range.id, "Lease already exists");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a lease regardless of its owner.
    pub async fn delete_lease(&self, lease: &Lease) -> FeedResult<()> {
        let deleted = self.container.delete(&lease.id, None).await?;
        if deleted {
            info!(lease_token = %lease.lease_token, "Deleted lease");
        }
        Ok(())
    }

    // =========================================================================
    // Conditional mutations
    // =========================================================================

    /// Take ownership of a lease selected by the balancer.
    ///
    /// Fails with `LeaseLost` if the stored owner is no longer the owner
    /// observed in `lease`.
    pub async fn acquire(&self, lease: &Lease) -> FeedResult<Lease> {
        let expected_owner = lease.owner.clone().filter(|o| !o.is_empty());
        let host_name = self.host_name.clone();
        self.mutate(lease, LeaseOperation::Acquire, move |current| {
            let stored_owner = current.owner.as_deref().filter(|o| !o.is_empty());
            if stored_owner != expected_owner.as_deref() {
                return Err(FeedError::lease_lost(&current.lease_token));
            }
            current.owner = Some(host_name.clone());
            current.timestamp = Utc::now();
            Ok(())
        })
        .await
    }

    /// Give up ownership of a lease.
    pub async fn release(&self, lease: &Lease) -> FeedResult<Lease> {
        let host_name = self.host_name.clone();
        self.mutate(lease, LeaseOperation::Release, move |current| {
            ensure_owner(current, &host_name)?;
            current.owner = None;
            current.timestamp = Utc::now();
            Ok(())
        })
        .await
    }

    /// Refresh the lease timestamp.
    pub async fn renew(&self, lease: &Lease) -> FeedResult<Lease> {
        let host_name = self.host_name.clone();
        self.mutate(lease, LeaseOperation::Renew, move |current| {
            ensure_owner(current, &host_name)?;
            current.timestamp = Utc::now();
            Ok(())
        })
        .await
    }

    /// Persist a continuation token into an owned lease.
    pub async fn checkpoint(&self, lease: &Lease, continuation_token: &str) -> FeedResult<Lease> {
        let host_name = self.host_name.clone();
        let continuation_token = continuation_token.to_string();
        self.mutate(lease, LeaseOperation::Checkpoint, move |current| {
            ensure_owner(current, &host_name)?;
            current.continuation_token = Some(continuation_token.clone());
            Ok(())
        })
        .await
    }

    /// Write the caller's copy of a lease.
    ///
    /// Owner, continuation, timestamp and properties are taken from `lease`.
    /// Fails with `LeaseLost` if the stored owner differs from `lease.owner`.
    pub async fn update_lease(&self, lease: &Lease) -> FeedResult<Lease> {
        let desired = lease.clone();
        self.mutate(lease, LeaseOperation::Update, move |current| {
            if current.owner != desired.owner {
                return Err(FeedError::lease_lost(&current.lease_token));
            }
            current.continuation_token = desired.continuation_token.clone();
            current.timestamp = desired.timestamp;
            current.properties = desired.properties.clone();
            Ok(())
        })
        .await
    }

    /// Apply `apply` to the lease and write it conditionally, re-reading and
    /// re-applying on etag conflicts.
    async fn mutate<F>(&self, lease: &Lease, operation: LeaseOperation, apply: F) -> FeedResult<Lease>
    where
        F: Fn(&mut Lease) -> FeedResult<()> + Send + Sync,
    {
        let span = lease_operation_span(&lease.lease_token, &self.host_name, operation);
        let label = operation.to_string();
        let result = async {
            let mut current = lease.clone();
            // One initial write plus up to LEASE_CONFLICT_RETRY_COUNT re-applications.
            for attempt in 0..=LEASE_CONFLICT_RETRY_COUNT {
                let mut candidate = current.clone();
                apply(&mut candidate)?;
                let etag = candidate.etag.clone().unwrap_or_default();

                match self.container.replace(candidate.to_document()?, &etag).await {
                    Ok(stored) => return Lease::from_document(stored),
                    Err(e) if e.is_precondition_failed() => {
                        debug!(attempt, "Etag conflict, re-reading lease");
                        metrics::record_conflict_retry();
                        match self.read_lease(&lease.id).await? {
                            Some(fresh) => current = fresh,
                            None => return Err(FeedError::lease_lost(&lease.lease_token)),
                        }
                    }
                    Err(e) if e.is_not_found() => {
                        return Err(FeedError::lease_lost(&lease.lease_token));
                    }
                    Err(e) => return Err(e),
                }
            }
            warn!("Lease update kept conflicting, giving up");
            Err(FeedError::lease_lost(&lease.lease_token))
        }
        .instrument(span)
        .await;

        let status = match &result {
            Ok(_) => "success",
            Err(e) if e.is_lease_lost() => "lost",
            Err(_) => "error",
        };
        metrics::record_lease_operation(&label, status);
        result
    }

}

fn ensure_owner(lease: &Lease, host_name: &str) -> FeedResult<()> {
    if lease.is_owned_by(host_name) {
        Ok(())
    } else {
        Err(FeedError::lease_lost(&lease.lease_token))
    }
}
