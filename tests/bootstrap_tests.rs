//! Integration tests for lease store bootstrap across hosts.
//!
//! These tests verify that concurrently starting hosts create every lease
//! exactly once and agree on a single initialization.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use changefeed::feed::{
    ChangeFeedSource, FeedResult, InMemoryChangeFeed, InMemoryLeaseContainer, LeaseStore,
    PartitionManager, ProcessorOptions,
};
use changefeed::types::{ChangeFeedPage, ChangeFeedRequest, PartitionRange};
use common::{DeliveryLog, eventually, fast_options, push_seqs};

/// Feed wrapper counting partition listings.
#[derive(Clone)]
struct CountingFeed {
    inner: InMemoryChangeFeed,
    listings: Arc<AtomicUsize>,
}

impl CountingFeed {
    fn new(inner: InMemoryChangeFeed) -> Self {
        Self {
            inner,
            listings: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeFeedSource for CountingFeed {
    fn collection_id(&self) -> &str {
        self.inner.collection_id()
    }

    async fn list_partition_ranges(&self) -> FeedResult<Vec<PartitionRange>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        self.inner.list_partition_ranges().await
    }

    async fn query_changes(&self, request: &ChangeFeedRequest) -> FeedResult<ChangeFeedPage> {
        self.inner.query_changes(request).await
    }
}

type CountingManager = PartitionManager<InMemoryLeaseContainer, CountingFeed>;

fn counting_manager(
    container: &Arc<InMemoryLeaseContainer>,
    feed: &CountingFeed,
    log: &DeliveryLog,
    host: &str,
) -> Arc<CountingManager> {
    let observer = log.observer(host);
    Arc::new(
        PartitionManager::new(
            container.clone(),
            Arc::new(feed.clone()),
            Arc::new(move || observer.clone()),
            fast_options(host),
        )
        .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hosts_bootstrap_once() {
    let container = Arc::new(InMemoryLeaseContainer::new());
    let feed = CountingFeed::new(InMemoryChangeFeed::with_partitions("coll", 8).await);
    let log = DeliveryLog::default();
    let hosts: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|host| counting_manager(&container, &feed, &log, host))
        .collect();

    let starts: Vec<_> = hosts
        .iter()
        .map(|manager| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start().await })
        })
        .collect();
    for start in starts {
        start.await.unwrap().unwrap();
    }

    assert_eq!(feed.listings(), 1);
    let store = LeaseStore::new(container.clone(), "", "observer");
    assert!(store.is_initialized().await.unwrap());

    let states = hosts[0].lease_states().await.unwrap();
    let mut tokens: Vec<_> = states.iter().map(|s| s.lease_token.clone()).collect();
    tokens.sort_by_key(|t| t.parse::<u32>().unwrap());
    assert_eq!(tokens, vec!["0", "1", "2", "3", "4", "5", "6", "7"]);

    // Every lease ends up owned and each host carries a fair share.
    let balanced = eventually(Duration::from_secs(10), || async {
        let counts: Vec<usize> = hosts.iter().map(|h| h.owned_lease_tokens().len()).collect();
        counts.iter().sum::<usize>() == 8 && counts.iter().all(|c| (2..=3).contains(c))
    })
    .await;
    assert!(balanced, "hosts never balanced");

    for host in &hosts {
        host.stop().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_host_skips_synchronization() {
    let container = Arc::new(InMemoryLeaseContainer::new());
    let feed = CountingFeed::new(InMemoryChangeFeed::with_partitions("coll", 2).await);
    let log = DeliveryLog::default();

    let first = counting_manager(&container, &feed, &log, "a");
    first.start().await.unwrap();
    assert_eq!(feed.listings(), 1);

    let second = counting_manager(&container, &feed, &log, "b");
    second.start().await.unwrap();
    assert_eq!(feed.listings(), 1);
    assert_eq!(second.lease_states().await.unwrap().len(), 2);

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_keeps_existing_leases_and_checkpoints() {
    let container = Arc::new(InMemoryLeaseContainer::new());
    let inner = InMemoryChangeFeed::with_partitions("coll", 2).await;
    let feed = CountingFeed::new(inner.clone());
    let log = DeliveryLog::default();
    push_seqs(&inner, "0", 1..=3).await;

    let manager = counting_manager(&container, &feed, &log, "a");
    manager.start().await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async {
            log.delivered_seqs().await.len() == 3
        })
        .await
    );
    manager.stop().await.unwrap();

    let before = manager.lease_states().await.unwrap();
    manager.start().await.unwrap();
    manager.stop().await.unwrap();
    let after = manager.lease_states().await.unwrap();

    assert_eq!(feed.listings(), 1);
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.lease_token, a.lease_token);
        assert_eq!(b.continuation_token, a.continuation_token);
    }
}

#[tokio::test(start_paused = true)]
async fn test_separate_prefixes_bootstrap_independently() {
    let container = Arc::new(InMemoryLeaseContainer::new());
    let feed = CountingFeed::new(InMemoryChangeFeed::with_partitions("coll", 3).await);
    let log = DeliveryLog::default();

    let mut orders = fast_options("a");
    orders.lease_prefix = "orders".to_string();
    let mut audit = fast_options("a");
    audit.lease_prefix = "audit".to_string();

    let build = |options: ProcessorOptions| {
        let observer = log.observer("a");
        PartitionManager::new(
            container.clone(),
            Arc::new(feed.clone()),
            Arc::new(move || observer.clone()),
            options,
        )
        .unwrap()
    };
    let first = build(orders);
    let second = build(audit);

    first.start().await.unwrap();
    second.start().await.unwrap();
    assert_eq!(feed.listings(), 2);
    assert_eq!(first.lease_states().await.unwrap().len(), 3);
    assert_eq!(second.lease_states().await.unwrap().len(), 3);

    let ids = container.document_ids().await;
    assert!(ids.iter().any(|id| id == "orderscoll..0"));
    assert!(ids.iter().any(|id| id == "auditcoll..0"));
    assert!(ids.iter().any(|id| id == "orders.info"));
    assert!(ids.iter().any(|id| id == "audit.info"));

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}
