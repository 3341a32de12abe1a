//! Reconciliation of partition ranges against leases.
//!
//! A lease whose partition token is no longer listed by the data source is
//! *retired*: its partition was split or merged away. New leases are seeded
//! from the retired leases they replace, resolved by key range:
//!
//! | Situation | Seed continuation |
//! |-----------|-------------------|
//! | no retired lease overlaps the range | none (start position applies) |
//! | a retired lease contains the range (split child) | that lease's continuation |
//! | retired leases lie inside the range (merge result) | earliest of their continuations |
//!
//! Retired leases are deleted only once their whole key range is covered by
//! live partitions, so no key range is ever left without a lease.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::FeedResult;
use super::lease::Lease;
use super::lease_manager::LeaseStoreManager;
use super::metrics;
use super::traits::{ChangeFeedSource, LeaseContainer};
use crate::types::{FeedRange, PartitionRange};

/// Keeps the set of leases in line with the partitions of the collection.
pub struct PartitionSynchronizer<C: LeaseContainer, S: ChangeFeedSource> {
    source: Arc<S>,
    leases: Arc<LeaseStoreManager<C>>,
}

impl<C: LeaseContainer, S: ChangeFeedSource> PartitionSynchronizer<C, S> {
    pub fn new(source: Arc<S>, leases: Arc<LeaseStoreManager<C>>) -> Self {
        Self { source, leases }
    }

    /// Full reconciliation pass.
    ///
    /// Creates a lease for every listed partition that has none, then deletes
    /// retired leases whose range is covered by live partitions. Returns the
    /// number of leases created.
    pub async fn create_missing_leases(&self) -> FeedResult<usize> {
        let ranges = self.source.list_partition_ranges().await?;
        let leases = self.leases.list_leases().await?;

        let live_tokens: HashSet<&str> = ranges.iter().map(|r| r.id.as_str()).collect();
        let leased_tokens: HashSet<&str> = leases.iter().map(|l| l.lease_token.as_str()).collect();
        let retired: Vec<&Lease> = leases
            .iter()
            .filter(|l| !live_tokens.contains(l.lease_token.as_str()))
            .collect();

        let mut created = 0;
        for range in ranges.iter().filter(|r| !leased_tokens.contains(r.id.as_str())) {
            let seed = self.seed_continuation(range, &retired);
            if self.leases.create_lease_if_not_exist(range, seed).await?.is_some() {
                created += 1;
            }
        }

        let mut deleted = 0;
        for lease in retired {
            if is_covered(&lease.feed_range, &ranges) {
                self.leases.delete_lease(lease).await?;
                deleted += 1;
            } else {
                warn!(
                    lease_token = %lease.lease_token,
                    feed_range = %lease.feed_range,
                    "Retired lease is not covered by live partitions, keeping it"
                );
            }
        }

        metrics::record_synchronizer_leases("created", created);
        metrics::record_synchronizer_leases("deleted", deleted);
        info!(
            partitions = ranges.len(),
            created, deleted, "Synchronized leases with partition ranges"
        );
        Ok(created)
    }

    /// Replace a lease whose partition split or vanished.
    ///
    /// Creates leases for the live partitions overlapping the lease's range,
    /// deletes the lease, and returns the leases created by this call. If no
    /// live partition overlaps, the lease is simply deleted.
    ///
    /// A partition that is still listed keeps its lease and continuation; the
    /// lease is only released so the next balancing tick can pick it up again.
    pub async fn handle_partition_gone(&self, lease: &Lease) -> FeedResult<Vec<Lease>> {
        let ranges = self.source.list_partition_ranges().await?;
        if ranges.iter().any(|r| r.id == lease.lease_token) {
            warn!(
                lease_token = %lease.lease_token,
                "Partition reported gone but is still listed, keeping lease"
            );
            if lease.is_owned_by(self.leases.host_name()) {
                match self.leases.release(lease).await {
                    Ok(_) => {}
                    Err(e) if e.is_lease_lost() => {
                        debug!(lease_token = %lease.lease_token, "Lease already moved on");
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(Vec::new());
        }

        let overlapping: Vec<&PartitionRange> = ranges
            .iter()
            .filter(|r| r.feed_range.overlaps(&lease.feed_range))
            .collect();

        if overlapping.is_empty() {
            info!(
                lease_token = %lease.lease_token,
                feed_range = %lease.feed_range,
                "Partition range retired, deleting lease"
            );
            self.leases.delete_lease(lease).await?;
            metrics::record_synchronizer_leases("deleted", 1);
            return Ok(Vec::new());
        }

        let live_tokens: HashSet<&str> = ranges.iter().map(|r| r.id.as_str()).collect();
        let leases = self.leases.list_leases().await?;
        let mut retired: Vec<&Lease> = leases
            .iter()
            .filter(|l| !live_tokens.contains(l.lease_token.as_str()))
            .collect();
        // The stored copy is authoritative; fall back to the caller's copy if
        // another host already removed it.
        if !retired.iter().any(|l| l.id == lease.id) {
            retired.push(lease);
        }

        let mut created = Vec::new();
        for range in overlapping {
            let seed = self.seed_continuation(range, &retired);
            match self.leases.create_lease_if_not_exist(range, seed).await? {
                Some(child) => created.push(child),
                None => debug!(lease_token = %range.id, "Replacement lease already exists"),
            }
        }

        self.leases.delete_lease(lease).await?;
        metrics::record_synchronizer_leases("created", created.len());
        metrics::record_synchronizer_leases("deleted", 1);
        info!(
            lease_token = %lease.lease_token,
            replacements = created.len(),
            "Replaced lease of a gone partition"
        );
        Ok(created)
    }

    fn seed_continuation(&self, range: &PartitionRange, retired: &[&Lease]) -> Option<String> {
        let parents: Vec<&Lease> = retired
            .iter()
            .copied()
            .filter(|l| l.feed_range.overlaps(&range.feed_range))
            .collect();

        if parents.is_empty() {
            return None;
        }

        if let Some(parent) = parents.iter().find(|l| l.feed_range.contains(&range.feed_range)) {
            debug!(
                lease_token = %range.id,
                parent = %parent.lease_token,
                "Seeding split child from parent"
            );
            return parent.continuation_token.clone();
        }

        let tokens: Vec<Option<String>> = parents
            .iter()
            .map(|l| l.continuation_token.clone())
            .collect();
        debug!(
            lease_token = %range.id,
            parents = parents.len(),
            "Seeding merged partition from earliest parent"
        );
        self.source.earliest_continuation(&tokens)
    }
}

/// Returns true if `target` is fully covered by the union of `ranges`.
fn is_covered(target: &FeedRange, ranges: &[PartitionRange]) -> bool {
    let mut overlapping: Vec<&FeedRange> = ranges
        .iter()
        .map(|r| &r.feed_range)
        .filter(|r| r.overlaps(target))
        .collect();
    overlapping.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));

    let mut cursor = target.min_inclusive.as_str();
    for range in overlapping {
        if range.min_inclusive.as_str() > cursor {
            return false;
        }
        if range.max_exclusive.as_str() > cursor {
            cursor = range.max_exclusive.as_str();
        }
        if cursor >= target.max_exclusive.as_str() {
            return true;
        }
    }
    false
}
