//! Centralized defaults and naming constants.
//!
//! Having every tunable default in one place makes it easier to:
//!
//! - Understand the timing relationships between loops
//! - Update values consistently
//! - Keep `ProcessorOptions::default()` and `from_env()` in sync
//!
//! # Categories
//!
//! - **Lease Timing**: expiration, renewal and acquisition intervals
//! - **Feed Reading**: poll delay and page size
//! - **Bootstrap**: initialization lock TTL and backoff
//! - **Document Naming**: suffixes used to build lease store document ids

// =============================================================================
// Lease Timing
// =============================================================================

/// How long a lease stays valid without renewal (seconds).
///
/// A lease whose `timestamp` is older than this is considered expired and
/// becomes eligible for acquisition by any host.
pub const DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS: u64 = 60;

/// How often an owned lease is renewed (seconds).
///
/// Must be comfortably below the expiration interval so that a couple of
/// failed renewals do not cost the lease.
pub const DEFAULT_LEASE_RENEW_INTERVAL_SECS: u64 = 17;

/// How often the load balancer re-evaluates lease distribution (seconds).
pub const DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS: u64 = 13;

/// Number of times a conditional lease update is re-applied after an etag
/// conflict caused by this host's own concurrent writes.
pub const LEASE_CONFLICT_RETRY_COUNT: usize = 5;

// =============================================================================
// Feed Reading
// =============================================================================

/// Delay between polls of a partition that returned no changes (milliseconds).
pub const DEFAULT_FEED_POLL_DELAY_MS: u64 = 5_000;

/// Default maximum number of documents requested per page.
pub const DEFAULT_MAX_ITEM_COUNT: usize = 100;

// =============================================================================
// Bootstrap
// =============================================================================

/// TTL of the bootstrap lock document (seconds).
///
/// Bounds how long a crashed bootstrapper can block the other hosts.
pub const DEFAULT_BOOTSTRAP_LOCK_TTL_SECS: u64 = 30;

/// Wait between failed bootstrap lock attempts (seconds).
pub const DEFAULT_BOOTSTRAP_SLEEP_SECS: u64 = 15;

/// Maximum bootstrap lock attempts before `start()` fails (0 = unbounded).
pub const DEFAULT_BOOTSTRAP_MAX_ATTEMPTS: usize = 0;

// =============================================================================
// Document Naming
// =============================================================================

/// Suffix of the "store initialized" marker document id.
pub const INITIALIZED_MARKER_SUFFIX: &str = ".info";

/// Suffix of the bootstrap lock document id.
pub const LOCK_DOCUMENT_SUFFIX: &str = ".lock";

/// Separator between the collection id and the partition token in lease ids.
pub const LEASE_ID_SEPARATOR: &str = "..";
