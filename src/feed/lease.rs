//! The lease document: ownership and progress record of one partition.
//!
//! A lease is stored as a JSON document in the lease container. The etag is
//! assigned by the container and travels with the in-memory copy so that
//! every mutation can be made conditional on the version it was read at.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::FeedResult;
use super::traits::StoredDocument;
use crate::types::FeedRange;

/// Ownership and progress record for one partition of the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Document id in the lease container.
    pub id: String,

    /// Partition token governed by this lease. Immutable after creation.
    pub lease_token: String,

    /// Key range of the partition.
    pub feed_range: FeedRange,

    /// Host currently holding the lease; `None` means unowned.
    #[serde(default)]
    pub owner: Option<String>,

    /// Resume point for this partition.
    #[serde(default)]
    pub continuation_token: Option<String>,

    /// Last time ownership was confirmed.
    pub timestamp: DateTime<Utc>,

    /// Version assigned by the container. Not part of the stored body.
    #[serde(skip)]
    pub etag: Option<String>,

    /// Custom metadata.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Lease {
    /// Create a fresh, unowned lease.
    pub fn new(
        id: impl Into<String>,
        lease_token: impl Into<String>,
        feed_range: FeedRange,
        continuation_token: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            lease_token: lease_token.into(),
            feed_range,
            owner: None,
            continuation_token,
            timestamp: Utc::now(),
            etag: None,
            properties: HashMap::new(),
        }
    }

    /// Returns true if nobody holds the lease.
    pub fn is_unowned(&self) -> bool {
        self.owner.as_deref().is_none_or(str::is_empty)
    }

    /// Returns true if `host` holds the lease.
    pub fn is_owned_by(&self, host: &str) -> bool {
        self.owner.as_deref() == Some(host)
    }

    /// Returns true if the lease has not been renewed within `expiration`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        match chrono::Duration::from_std(expiration) {
            Ok(expiration) => self.timestamp + expiration < now,
            Err(_) => false,
        }
    }

    /// Returns true if the lease is unowned or its owner stopped renewing it.
    pub fn is_available(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        self.is_unowned() || self.is_expired_at(now, expiration)
    }

    /// Decode a lease from a stored document, carrying over its etag.
    pub fn from_document(document: StoredDocument) -> FeedResult<Self> {
        let mut lease: Lease = serde_json::from_value(document.body)?;
        lease.etag = Some(document.etag);
        Ok(lease)
    }

    /// Encode this lease as a stored document body.
    pub fn to_document(&self) -> FeedResult<StoredDocument> {
        Ok(StoredDocument {
            id: self.id.clone(),
            etag: self.etag.clone().unwrap_or_default(),
            body: serde_json::to_value(self)?,
            ttl: None,
        })
    }

    /// Snapshot of this lease as seen at `now`.
    pub fn state_at(&self, now: DateTime<Utc>, expiration: Duration) -> LeaseState {
        LeaseState {
            lease_token: self.lease_token.clone(),
            owner: self.owner.clone().filter(|o| !o.is_empty()),
            continuation_token: self.continuation_token.clone(),
            timestamp: self.timestamp,
            expired: self.is_available(now, expiration),
        }
    }
}

/// Read-only view of a lease, as reported by `PartitionManager::lease_states`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseState {
    /// Partition token.
    pub lease_token: String,
    /// Current owner, if any.
    pub owner: Option<String>,
    /// Last checkpointed continuation.
    pub continuation_token: Option<String>,
    /// Last renewal.
    pub timestamp: DateTime<Utc>,
    /// Whether the lease is unowned or past its expiration interval.
    pub expired: bool,
}
