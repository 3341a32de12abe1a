//! Equal-partitions load balancing strategy.
//!
//! Each host independently computes a target lease count from a snapshot of
//! every lease and tries to reach it:
//!
//! 1. Leases that are unowned or whose owner stopped renewing are *expired*;
//!    the owners of the remaining leases, plus this host, are the active hosts.
//! 2. `target = ceil(total / active_hosts)`, clamped to
//!    `[min_scale_count, max_scale_count]` (0 disables a bound).
//! 3. Below target, expired leases are taken first (lowest id first).
//! 4. With nothing expired, leases are stolen from the most loaded host while
//!    it holds more than `target`, or at least `target` when more than one
//!    lease is still missing.
//!
//! Repeated ticks on every host converge to `floor(M/N)` or `ceil(M/N)`
//! leases per host. The strategy is pure; acquisition races are settled by
//! the conditional writes in `LeaseStoreManager::acquire`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::config::ProcessorOptions;
use super::lease::Lease;
use super::traits::LoadBalancingStrategy;

/// Default strategy: spread leases evenly across active hosts.
#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host_name: String,
    min_scale_count: usize,
    max_scale_count: usize,
    lease_expiration_interval: Duration,
}

impl EqualPartitionsBalancingStrategy {
    pub fn new(
        host_name: impl Into<String>,
        min_scale_count: usize,
        max_scale_count: usize,
        lease_expiration_interval: Duration,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            min_scale_count,
            max_scale_count,
            lease_expiration_interval,
        }
    }

    /// Build the strategy from processor options.
    pub fn from_options(options: &ProcessorOptions) -> Self {
        Self::new(
            options.host_name.clone(),
            options.min_scale_count,
            options.max_scale_count,
            options.lease_expiration_interval,
        )
    }

    /// Target number of leases for this host.
    pub fn target_lease_count(&self, total_leases: usize, active_hosts: usize) -> usize {
        if total_leases == 0 {
            return 0;
        }
        let mut target = total_leases.div_ceil(active_hosts.max(1));
        if self.min_scale_count > 0 && target < self.min_scale_count {
            target = self.min_scale_count;
        }
        if self.max_scale_count > 0 && target > self.max_scale_count {
            target = self.max_scale_count;
        }
        target
    }

    /// Select leases to take, evaluating expiry at `now`.
    pub fn select_leases_to_take_at(&self, all_leases: &[Lease], now: DateTime<Utc>) -> Vec<Lease> {
        let mut expired: Vec<&Lease> = Vec::new();
        let mut workers: HashMap<&str, Vec<&Lease>> = HashMap::new();
        workers.entry(self.host_name.as_str()).or_default();

        for lease in all_leases {
            if lease.is_available(now, self.lease_expiration_interval) {
                expired.push(lease);
            } else if let Some(owner) = lease.owner.as_deref() {
                workers.entry(owner).or_default().push(lease);
            }
        }

        let target = self.target_lease_count(all_leases.len(), workers.len());
        let mine = workers.get(self.host_name.as_str()).map_or(0, Vec::len);
        if mine >= target {
            return Vec::new();
        }
        let mut deficit = target - mine;

        debug!(
            host = %self.host_name,
            total = all_leases.len(),
            active_hosts = workers.len(),
            target,
            mine,
            expired = expired.len(),
            "Evaluated lease distribution"
        );

        if !expired.is_empty() {
            expired.sort_by(|a, b| a.id.cmp(&b.id));
            return expired.into_iter().take(deficit).cloned().collect();
        }

        workers.remove(self.host_name.as_str());
        for leases in workers.values_mut() {
            // Highest id last so that pop() yields the lowest id.
            leases.sort_by(|a, b| b.id.cmp(&a.id));
        }

        let mut stolen = Vec::new();
        while deficit > 0 {
            let Some((_, leases)) = workers
                .iter_mut()
                .max_by(|(host_a, a), (host_b, b)| a.len().cmp(&b.len()).then(host_b.cmp(host_a)))
            else {
                break;
            };
            let count = leases.len();
            if !(count > target || (deficit > 1 && count >= target)) {
                break;
            }
            let Some(lease) = leases.pop() else {
                break;
            };
            stolen.push(lease.clone());
            deficit -= 1;
        }
        stolen
    }
}

impl LoadBalancingStrategy for EqualPartitionsBalancingStrategy {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease> {
        self.select_leases_to_take_at(all_leases, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeedRange;

    const EXPIRATION: Duration = Duration::from_secs(60);

    fn strategy(host: &str) -> EqualPartitionsBalancingStrategy {
        EqualPartitionsBalancingStrategy::new(host, 0, 0, EXPIRATION)
    }

    fn lease(id: u32, owner: Option<&str>, now: DateTime<Utc>) -> Lease {
        let mut lease = Lease::new(
            format!("coll..{:03}", id),
            id.to_string(),
            FeedRange::new("00", "FF"),
            None,
        );
        lease.owner = owner.map(str::to_string);
        lease.timestamp = now;
        lease
    }

    fn ids(leases: &[Lease]) -> Vec<String> {
        leases.iter().map(|l| l.lease_token.clone()).collect()
    }

    #[test]
    fn test_target_lease_count() {
        let s = strategy("a");
        assert_eq!(s.target_lease_count(10, 3), 4);
        assert_eq!(s.target_lease_count(9, 3), 3);
        assert_eq!(s.target_lease_count(0, 3), 0);

        let bounded = EqualPartitionsBalancingStrategy::new("a", 2, 3, EXPIRATION);
        assert_eq!(bounded.target_lease_count(10, 1), 3);
        assert_eq!(bounded.target_lease_count(2, 4), 2);
    }

    #[test]
    fn test_single_host_takes_every_unowned_lease() {
        let now = Utc::now();
        let leases: Vec<_> = (0..4).map(|i| lease(i, None, now)).collect();
        let taken = strategy("a").select_leases_to_take_at(&leases, now);
        assert_eq!(ids(&taken), vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn test_takes_expired_up_to_fair_share() {
        let now = Utc::now();
        let mut leases: Vec<_> = (0..6).map(|i| lease(i, None, now)).collect();
        leases[0].owner = Some("b".to_string());
        let taken = strategy("a").select_leases_to_take_at(&leases, now);
        // hosts {a, b}: target 3, lowest ids first
        assert_eq!(ids(&taken), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_expired_owner_is_not_an_active_host() {
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(120);
        let leases = vec![lease(0, Some("b"), stale), lease(1, Some("b"), stale)];
        let taken = strategy("a").select_leases_to_take_at(&leases, now);
        assert_eq!(taken.len(), 2);
    }

    #[test]
    fn test_nothing_when_at_target() {
        let now = Utc::now();
        let leases = vec![
            lease(0, Some("a"), now),
            lease(1, Some("a"), now),
            lease(2, Some("b"), now),
        ];
        assert!(strategy("a").select_leases_to_take_at(&leases, now).is_empty());
        // b has 1, target 2, nobody holds more than 2: no steal
        assert!(strategy("b").select_leases_to_take_at(&leases, now).is_empty());
    }

    #[test]
    fn test_steals_from_most_loaded_host() {
        let now = Utc::now();
        let mut leases = Vec::new();
        for i in 0..4 {
            leases.push(lease(i, Some("b"), now));
        }
        for i in 4..6 {
            leases.push(lease(i, Some("c"), now));
        }
        // hosts {a, b, c}: target 2; b holds 4
        let taken = strategy("a").select_leases_to_take_at(&leases, now);
        assert_eq!(ids(&taken), vec!["0", "1"]);
    }

    #[test]
    fn test_steal_ties_broken_by_host_name() {
        let now = Utc::now();
        let mut leases = Vec::new();
        for i in 0..5 {
            leases.push(lease(i, Some("c"), now));
        }
        for i in 5..10 {
            leases.push(lease(i, Some("b"), now));
        }
        // hosts {a, b, c}: target 4
        let taken = strategy("a").select_leases_to_take_at(&leases, now);
        assert_eq!(ids(&taken), vec!["5", "0", "6"]);
    }

    #[test]
    fn test_max_scale_count_caps_acquisition() {
        let now = Utc::now();
        let leases: Vec<_> = (0..10).map(|i| lease(i, None, now)).collect();
        let s = EqualPartitionsBalancingStrategy::new("a", 0, 3, EXPIRATION);
        assert_eq!(s.select_leases_to_take_at(&leases, now).len(), 3);
    }

    #[test]
    fn test_no_leases() {
        assert!(strategy("a").select_leases_to_take(&[]).is_empty());
    }
}
