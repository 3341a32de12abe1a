//! Configuration for the change-feed processor.
//!
//! # Timing Relationships
//!
//! ```text
//! lease_renew_interval  <  lease_expiration_interval
//!         17s                       60s
//!
//! lease_acquire_interval: how often the load balancer runs (13s, jittered)
//! bootstrap_lock_ttl:     how long a crashed bootstrapper blocks others (30s)
//! ```
//!
//! A host that stops renewing loses its leases after `lease_expiration_interval`
//! and other hosts pick them up on their next balancing tick.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::checkpointer::CheckpointFrequency;
use crate::constants::{
    DEFAULT_BOOTSTRAP_LOCK_TTL_SECS, DEFAULT_BOOTSTRAP_MAX_ATTEMPTS, DEFAULT_BOOTSTRAP_SLEEP_SECS,
    DEFAULT_FEED_POLL_DELAY_MS, DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS,
    DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS, DEFAULT_LEASE_RENEW_INTERVAL_SECS,
    DEFAULT_MAX_ITEM_COUNT, LEASE_ID_SEPARATOR,
};
use crate::types::StartFrom;

/// Options for one host taking part in change-feed processing.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Identity of this host as written into lease `owner` fields.
    /// Must be unique among the hosts sharing a lease store.
    pub host_name: String,

    /// Prefix of every document id in the lease container.
    /// Lets several processors share one container.
    pub lease_prefix: String,

    /// Lower bound on the number of leases this host targets (0 = no bound).
    pub min_scale_count: usize,

    /// Upper bound on the number of leases this host owns (0 = no bound).
    pub max_scale_count: usize,

    /// How long a lease stays valid without renewal.
    pub lease_expiration_interval: Duration,

    /// How often owned leases are renewed.
    pub lease_renew_interval: Duration,

    /// How often the load balancer runs.
    pub lease_acquire_interval: Duration,

    /// Delay between polls of a partition with no new changes.
    pub feed_poll_delay: Duration,

    /// Maximum number of documents requested per page.
    pub max_item_count: usize,

    /// When the processor persists continuation tokens.
    pub checkpoint_frequency: CheckpointFrequency,

    /// Where to start reading partitions that have no continuation yet.
    pub start_from: StartFrom,

    /// TTL of the bootstrap lock document.
    pub bootstrap_lock_ttl: Duration,

    /// Wait between failed bootstrap lock attempts.
    pub bootstrap_sleep_time: Duration,

    /// Bootstrap lock attempts before `start()` fails (0 = unbounded).
    pub bootstrap_max_attempts: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            host_name: format!("host-{:08x}", fastrand::u32(..)),
            lease_prefix: String::new(),
            min_scale_count: 0,
            max_scale_count: 0,
            lease_expiration_interval: Duration::from_secs(DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS),
            lease_renew_interval: Duration::from_secs(DEFAULT_LEASE_RENEW_INTERVAL_SECS),
            lease_acquire_interval: Duration::from_secs(DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS),
            feed_poll_delay: Duration::from_millis(DEFAULT_FEED_POLL_DELAY_MS),
            max_item_count: DEFAULT_MAX_ITEM_COUNT,
            checkpoint_frequency: CheckpointFrequency::default(),
            start_from: StartFrom::default(),
            bootstrap_lock_ttl: Duration::from_secs(DEFAULT_BOOTSTRAP_LOCK_TTL_SECS),
            bootstrap_sleep_time: Duration::from_secs(DEFAULT_BOOTSTRAP_SLEEP_SECS),
            bootstrap_max_attempts: DEFAULT_BOOTSTRAP_MAX_ATTEMPTS,
        }
    }
}

impl ProcessorOptions {
    /// Default options for the named host.
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ..Self::default()
        }
    }

    /// Validate the options, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host_name.trim().is_empty() {
            errors.push("host_name must not be empty".to_string());
        }

        if self.lease_prefix.contains(LEASE_ID_SEPARATOR) {
            errors.push(format!(
                "lease_prefix ({:?}) must not contain {:?}",
                self.lease_prefix, LEASE_ID_SEPARATOR
            ));
        }

        // Renewal must happen before the lease expires
        if self.lease_renew_interval >= self.lease_expiration_interval {
            errors.push(format!(
                "lease_renew_interval ({:?}) must be less than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            ));
        }

        if self.lease_renew_interval.is_zero() {
            errors.push("lease_renew_interval must be positive".to_string());
        }

        if self.lease_acquire_interval.is_zero() {
            errors.push("lease_acquire_interval must be positive".to_string());
        }

        if self.max_item_count == 0 {
            errors.push("max_item_count must be at least 1".to_string());
        }

        if self.max_scale_count != 0 && self.max_scale_count < self.min_scale_count {
            errors.push(format!(
                "max_scale_count ({}) must be 0 or at least min_scale_count ({})",
                self.max_scale_count, self.min_scale_count
            ));
        }

        if self.bootstrap_lock_ttl.is_zero() {
            errors.push("bootstrap_lock_ttl must be positive".to_string());
        }

        if self.checkpoint_frequency.document_count == Some(0) {
            errors.push("checkpoint_frequency.document_count must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Create options from environment variables.
    ///
    /// Environment variables:
    /// - `CHANGEFEED_HOST_NAME`: host identity (default: random `host-xxxxxxxx`)
    /// - `CHANGEFEED_LEASE_PREFIX`: lease document id prefix (default: empty)
    /// - `CHANGEFEED_MIN_SCALE_COUNT` / `CHANGEFEED_MAX_SCALE_COUNT`: lease bounds (default: 0)
    /// - `CHANGEFEED_LEASE_EXPIRATION_SECS`: lease expiration (default: 60)
    /// - `CHANGEFEED_LEASE_RENEW_SECS`: renewal interval (default: 17)
    /// - `CHANGEFEED_LEASE_ACQUIRE_SECS`: balancing interval (default: 13)
    /// - `CHANGEFEED_FEED_POLL_DELAY_MS`: idle poll delay (default: 5000)
    /// - `CHANGEFEED_MAX_ITEM_COUNT`: page size (default: 100)
    /// - `CHANGEFEED_CHECKPOINT_EXPLICIT`: "true" to checkpoint only on request
    /// - `CHANGEFEED_CHECKPOINT_DOCUMENT_COUNT`: checkpoint every N documents
    /// - `CHANGEFEED_CHECKPOINT_INTERVAL_MS`: checkpoint every T milliseconds
    /// - `CHANGEFEED_START_FROM`: "now", "beginning" or an RFC 3339 timestamp (default: now)
    /// - `CHANGEFEED_BOOTSTRAP_LOCK_TTL_SECS`: bootstrap lock TTL (default: 30)
    /// - `CHANGEFEED_BOOTSTRAP_SLEEP_SECS`: bootstrap retry wait (default: 15)
    /// - `CHANGEFEED_BOOTSTRAP_MAX_ATTEMPTS`: bootstrap attempts, 0 = unbounded (default: 0)
    ///
    /// Unparseable numeric values fall back to their defaults; an unparseable
    /// start position is an error.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let host_name = std::env::var("CHANGEFEED_HOST_NAME").unwrap_or(defaults.host_name);

        let lease_prefix = std::env::var("CHANGEFEED_LEASE_PREFIX").unwrap_or(defaults.lease_prefix);

        let min_scale_count: usize = std::env::var("CHANGEFEED_MIN_SCALE_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.min_scale_count);

        let max_scale_count: usize = std::env::var("CHANGEFEED_MAX_SCALE_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_scale_count);

        let lease_expiration_interval = std::env::var("CHANGEFEED_LEASE_EXPIRATION_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_expiration_interval);

        let lease_renew_interval = std::env::var("CHANGEFEED_LEASE_RENEW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_renew_interval);

        let lease_acquire_interval = std::env::var("CHANGEFEED_LEASE_ACQUIRE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_acquire_interval);

        let feed_poll_delay = std::env::var("CHANGEFEED_FEED_POLL_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.feed_poll_delay);

        let max_item_count: usize = std::env::var("CHANGEFEED_MAX_ITEM_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_item_count);

        let checkpoint_frequency = CheckpointFrequency {
            explicit: std::env::var("CHANGEFEED_CHECKPOINT_EXPLICIT")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(defaults.checkpoint_frequency.explicit),
            document_count: std::env::var("CHANGEFEED_CHECKPOINT_DOCUMENT_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(defaults.checkpoint_frequency.document_count),
            time_interval: std::env::var("CHANGEFEED_CHECKPOINT_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .or(defaults.checkpoint_frequency.time_interval),
        };

        let start_from = match std::env::var("CHANGEFEED_START_FROM") {
            Ok(value) => parse_start_from(&value)?,
            Err(_) => defaults.start_from,
        };

        let bootstrap_lock_ttl = std::env::var("CHANGEFEED_BOOTSTRAP_LOCK_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.bootstrap_lock_ttl);

        let bootstrap_sleep_time = std::env::var("CHANGEFEED_BOOTSTRAP_SLEEP_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.bootstrap_sleep_time);

        let bootstrap_max_attempts: usize = std::env::var("CHANGEFEED_BOOTSTRAP_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bootstrap_max_attempts);

        Ok(Self {
            host_name,
            lease_prefix,
            min_scale_count,
            max_scale_count,
            lease_expiration_interval,
            lease_renew_interval,
            lease_acquire_interval,
            feed_poll_delay,
            max_item_count,
            checkpoint_frequency,
            start_from,
            bootstrap_lock_ttl,
            bootstrap_sleep_time,
            bootstrap_max_attempts,
        })
    }
}

/// Parse a start position: "now", "beginning" or an RFC 3339 timestamp.
pub fn parse_start_from(value: &str) -> Result<StartFrom, String> {
    match value.trim().to_lowercase().as_str() {
        "now" | "" => Ok(StartFrom::Now),
        "beginning" => Ok(StartFrom::Beginning),
        _ => DateTime::parse_from_rfc3339(value.trim())
            .map(|t| StartFrom::Time(t.with_timezone(&Utc)))
            .map_err(|e| format!("Invalid CHANGEFEED_START_FROM {:?}: {}", value, e)),
    }
}
