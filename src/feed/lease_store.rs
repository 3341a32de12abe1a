//! One-time initialization state of a lease store.
//!
//! Two documents live next to the leases:
//!
//! | Document | Id | Lifetime |
//! |----------|----|----------|
//! | initialized marker | `{prefix}.info` | permanent, created once |
//! | bootstrap lock | `{prefix}.lock` | TTL-bounded, deleted by its holder |
//!
//! The lock is taken with a conditional create and released with a delete
//! conditional on the etag recorded at acquisition, so a host never releases
//! a lock that expired and was re-acquired by someone else.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{FeedError, FeedResult};
use super::traits::{LeaseContainer, StoredDocument};
use crate::constants::{INITIALIZED_MARKER_SUFFIX, LOCK_DOCUMENT_SUFFIX};

/// Initialization marker and bootstrap lock of one lease store.
pub struct LeaseStore<C: LeaseContainer> {
    container: Arc<C>,
    host_name: String,
    marker_id: String,
    lock_id: String,
    /// Etag of the lock document while this host holds it.
    lock_etag: Mutex<Option<String>>,
}

impl<C: LeaseContainer> LeaseStore<C> {
    /// Create a lease store view for documents under `lease_prefix`.
    pub fn new(container: Arc<C>, lease_prefix: &str, host_name: impl Into<String>) -> Self {
        Self {
            container,
            host_name: host_name.into(),
            marker_id: format!("{}{}", lease_prefix, INITIALIZED_MARKER_SUFFIX),
            lock_id: format!("{}{}", lease_prefix, LOCK_DOCUMENT_SUFFIX),
            lock_etag: Mutex::new(None),
        }
    }

    /// Id of the initialized marker document.
    pub fn marker_id(&self) -> &str {
        &self.marker_id
    }

    /// Id of the bootstrap lock document.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Returns true once some host has completed bootstrap.
    pub async fn is_initialized(&self) -> FeedResult<bool> {
        Ok(self.container.read(&self.marker_id).await?.is_some())
    }

    /// Mark the store as initialized.
    ///
    /// Succeeds whether this call created the marker or it already existed.
    pub async fn mark_initialized(&self) -> FeedResult<()> {
        let marker = StoredDocument::new(
            self.marker_id.clone(),
            json!({
                "id": self.marker_id,
                "initializedBy": self.host_name,
                "initializedAt": Utc::now(),
            }),
        );
        match self.container.create_if_absent(marker).await {
            Ok(_) => {
                info!(host = %self.host_name, "Lease store marked initialized");
                Ok(())
            }
            Err(FeedError::AlreadyExists { .. }) => {
                debug!(host = %self.host_name, "Lease store already marked initialized");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Try to take the bootstrap lock for `ttl`.
    ///
    /// Returns false if another host holds a live lock.
    pub async fn acquire_initialization_lock(&self, ttl: Duration) -> FeedResult<bool> {
        let lock = StoredDocument::new(
            self.lock_id.clone(),
            json!({
                "id": self.lock_id,
                "owner": self.host_name,
                "acquiredAt": Utc::now(),
            }),
        )
        .with_ttl(ttl);

        match self.container.create_if_absent(lock).await {
            Ok(stored) => {
                *self.lock_etag.lock().await = Some(stored.etag);
                debug!(host = %self.host_name, ttl = ?ttl, "Acquired bootstrap lock");
                Ok(true)
            }
            Err(FeedError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release the bootstrap lock held by this host.
    ///
    /// Returns false, without error, if this host does not hold the lock or
    /// the lock expired and was taken over since.
    pub async fn release_initialization_lock(&self) -> FeedResult<bool> {
        let Some(etag) = self.lock_etag.lock().await.take() else {
            return Ok(false);
        };
        match self.container.delete(&self.lock_id, Some(&etag)).await {
            Ok(deleted) => {
                if !deleted {
                    warn!(host = %self.host_name, "Bootstrap lock expired before release");
                }
                Ok(deleted)
            }
            Err(FeedError::PreconditionFailed { .. }) => {
                warn!(host = %self.host_name, "Bootstrap lock was taken over before release");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
