//! Tracing spans for lease and partition operations.
//!
//! Spans carry the partition token and host name so that log lines emitted
//! inside a supervisor, the load balancer or the bootstrapper can be
//! correlated without repeating those fields at every call site.
//!
//! # Example
//!
//! ```rust
//! use changefeed::feed::observability::{lease_operation_span, LeaseOperation};
//! use tracing::Instrument;
//!
//! # async fn example() {
//! let span = lease_operation_span("0", "host-a", LeaseOperation::Acquire);
//! async {
//!     // acquire the lease
//! }
//! .instrument(span)
//! .await;
//! # }
//! ```

use std::fmt;

use tracing::{Level, Span, span};

/// Lease operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOperation {
    /// Taking ownership of a lease.
    Acquire,
    /// Refreshing the lease timestamp.
    Renew,
    /// Giving up ownership.
    Release,
    /// Persisting a continuation token.
    Checkpoint,
    /// Rewriting properties or other lease fields.
    Update,
}

impl fmt::Display for LeaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquire => write!(f, "acquire"),
            Self::Renew => write!(f, "renew"),
            Self::Release => write!(f, "release"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Create a span for a single lease operation.
pub fn lease_operation_span(lease_token: &str, host: &str, operation: LeaseOperation) -> Span {
    span!(
        Level::DEBUG,
        "lease.operation",
        lease_token = %lease_token,
        host = %host,
        operation = %operation,
    )
}

/// Create a span covering the lifetime of one partition supervisor.
pub fn partition_supervisor_span(lease_token: &str, host: &str) -> Span {
    span!(
        Level::INFO,
        "partition.supervisor",
        lease_token = %lease_token,
        host = %host,
    )
}

/// Create a span for one load balancer evaluation.
pub fn balancer_tick_span(host: &str, lease_count: usize) -> Span {
    span!(
        Level::DEBUG,
        "balancer.tick",
        host = %host,
        lease_count,
        taken = tracing::field::Empty,
    )
}

/// Create a span for the bootstrap of a lease store.
pub fn bootstrap_span(host: &str, lease_prefix: &str) -> Span {
    span!(
        Level::INFO,
        "lease_store.bootstrap",
        host = %host,
        lease_prefix = %lease_prefix,
    )
}
