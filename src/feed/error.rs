//! Error types for the change-feed engine.
//!
//! # Error Handling Patterns
//!
//! The engine uses two patterns depending on where a failure happens:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used where a failure changes what this host is allowed to do:
//! - Lease acquisition, release and checkpoint (`LeaseLost`)
//! - Bootstrap (lock contention that exhausts its attempts)
//! - Configuration validation
//!
//! ## Isolate (Log and Contain)
//!
//! Used for per-partition work. A processor failure terminates that
//! partition's supervisor and nothing else; the controller logs it, releases
//! the lease where appropriate and the load balancer takes it from there.
//!
//! # Classification
//!
//! Errors raised by the data source are classified into an
//! [`ErrorDisposition`] by [`FeedError::classify`]. Every kind has its own
//! arm; there is no fallthrough between kinds.

use std::time::Duration;

use thiserror::Error;

/// Result type for engine operations.
pub type FeedResult<T> = Result<T, FeedError>;

/// Boxed error returned by observer callbacks.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the change-feed engine and its collaborators.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The data source asked us to back off.
    #[error("Request throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// The requested page is too large for the data source to return.
    #[error("Requested page of {max_item_count} items is too large")]
    PageTooLarge { max_item_count: usize },

    /// The partition was split; its lease must be replaced by child leases.
    #[error("Partition {partition_token} was split")]
    PartitionSplit { partition_token: String },

    /// The partition no longer exists (merged away or collection range retired).
    #[error("Partition {partition_token} not found")]
    PartitionNotFound { partition_token: String },

    /// The lease changed hands or disappeared underneath us.
    #[error("Lease {lease_token} lost")]
    LeaseLost { lease_token: String },

    /// The operation was cancelled cooperatively.
    #[error("Operation cancelled")]
    Cancelled,

    /// Document already exists (conditional create lost the race).
    #[error("Document {id} already exists")]
    AlreadyExists { id: String },

    /// Document does not exist.
    #[error("Document {id} not found")]
    NotFound { id: String },

    /// Etag precondition failed on a conditional write.
    #[error("Precondition failed for document {id}")]
    PreconditionFailed { id: String },

    /// The bootstrap lock could not be acquired within the allowed attempts.
    #[error("Bootstrap lock unavailable after {attempts} attempts")]
    BootstrapLockUnavailable { attempts: usize },

    /// The partition manager is already running.
    #[error("Partition manager is already running")]
    AlreadyRunning,

    /// The observer returned an error while processing changes.
    #[error("Observer error on lease {lease_token}: {message}")]
    Observer { lease_token: String, message: String },

    /// Error reported by the change-feed data source.
    #[error("Change feed source error: {0}")]
    Source(String),

    /// Error reported by the lease container.
    #[error("Lease store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// What the processor should do with an error raised while reading a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Retry the same request after the given delay; keep the lease.
    RetryAfter(Duration),
    /// Halve the page size and retry immediately.
    ShrinkPage,
    /// Partition split or vanished; terminate and reconcile leases.
    Gone,
    /// Ownership lost; terminate without releasing.
    LeaseLost,
    /// Cooperative shutdown; terminate and release.
    Cancelled,
    /// Anything else; terminate, release and let another host retry.
    Fatal,
}

impl ErrorDisposition {
    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ErrorDisposition::RetryAfter(_) => "retry_after",
            ErrorDisposition::ShrinkPage => "shrink_page",
            ErrorDisposition::Gone => "gone",
            ErrorDisposition::LeaseLost => "lease_lost",
            ErrorDisposition::Cancelled => "cancelled",
            ErrorDisposition::Fatal => "fatal",
        }
    }
}

impl FeedError {
    /// Create a `LeaseLost` error for a lease token.
    pub fn lease_lost(lease_token: impl Into<String>) -> Self {
        FeedError::LeaseLost {
            lease_token: lease_token.into(),
        }
    }

    /// Classify this error for the partition processor.
    pub fn classify(&self) -> ErrorDisposition {
        match self {
            FeedError::Throttled { retry_after } => ErrorDisposition::RetryAfter(*retry_after),
            FeedError::PageTooLarge { .. } => ErrorDisposition::ShrinkPage,
            FeedError::PartitionSplit { .. } => ErrorDisposition::Gone,
            FeedError::PartitionNotFound { .. } => ErrorDisposition::Gone,
            FeedError::LeaseLost { .. } => ErrorDisposition::LeaseLost,
            FeedError::Cancelled => ErrorDisposition::Cancelled,

            FeedError::AlreadyExists { .. }
            | FeedError::NotFound { .. }
            | FeedError::PreconditionFailed { .. }
            | FeedError::BootstrapLockUnavailable { .. }
            | FeedError::AlreadyRunning
            | FeedError::Observer { .. }
            | FeedError::Source(_)
            | FeedError::Store(_)
            | FeedError::Config(_)
            | FeedError::Serde(_) => ErrorDisposition::Fatal,
        }
    }

    /// Check if this error means ownership of a lease was lost.
    #[inline]
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, FeedError::LeaseLost { .. })
    }

    /// Check if this error means the partition must be reconciled.
    #[inline]
    pub fn is_partition_gone(&self) -> bool {
        matches!(
            self,
            FeedError::PartitionSplit { .. } | FeedError::PartitionNotFound { .. }
        )
    }

    /// Check if this error is retriable in place (transient).
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            FeedError::Throttled { .. } => true,
            FeedError::PageTooLarge { max_item_count } => *max_item_count > 1,
            FeedError::Store(_) => true,

            FeedError::PartitionSplit { .. }
            | FeedError::PartitionNotFound { .. }
            | FeedError::LeaseLost { .. }
            | FeedError::Cancelled
            | FeedError::AlreadyExists { .. }
            | FeedError::NotFound { .. }
            | FeedError::PreconditionFailed { .. }
            | FeedError::BootstrapLockUnavailable { .. }
            | FeedError::AlreadyRunning
            | FeedError::Observer { .. }
            | FeedError::Source(_)
            | FeedError::Config(_)
            | FeedError::Serde(_) => false,
        }
    }

    /// Check if this is a conditional-write conflict.
    #[inline]
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, FeedError::PreconditionFailed { .. })
    }

    /// Check if this is a "document not found" error.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, FeedError::NotFound { .. })
    }
}
