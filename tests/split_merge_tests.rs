//! Integration tests for partition splits and merges.
//!
//! These tests verify that a lease whose partition splits or merges is
//! replaced by leases for the new partitions, that the replacements resume
//! from the retired lease's continuation, and that no change is lost.

mod common;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use changefeed::feed::{InMemoryChangeFeed, InMemoryLeaseContainer};
use common::{DeliveryLog, Manager, eventually, fast_options, manager, push_seqs};

async fn lease_tokens(manager: &Manager) -> BTreeSet<String> {
    manager
        .lease_states()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.lease_token)
        .collect()
}

async fn continuation_of(manager: &Manager, token: &str) -> Option<String> {
    manager
        .lease_states()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.lease_token == token)
        .and_then(|s| s.continuation_token)
}

fn tokens(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_split_children_resume_from_parent_continuation() {
    let container = Arc::new(InMemoryLeaseContainer::new());
    let feed = InMemoryChangeFeed::with_partitions("coll", 1).await;
    let log = DeliveryLog::default();
    push_seqs(&feed, "0", 1..=3).await;

    let host = manager(&container, &feed, &log, fast_options("a"));
    host.start().await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async {
            continuation_of(&host, "0").await.as_deref() == Some("3")
        })
        .await
    );

    let (left, right) = feed.split("0").await.unwrap();
    push_seqs(&feed, &left, 4..=5).await;
    push_seqs(&feed, &right, 6..=6).await;

    let expected: BTreeSet<u64> = (1..=6).collect();
    assert!(eventually(Duration::from_secs(5), || async { log.delivered_seqs().await == expected }).await);
    assert!(
        eventually(Duration::from_secs(5), || async {
            host.owned_lease_tokens() == vec![left.clone(), right.clone()]
        })
        .await
    );
    assert_eq!(lease_tokens(&host).await, tokens(&[left.as_str(), right.as_str()]));

    // Children started at the parent's checkpoint, so nothing was replayed.
    let mut seen: HashMap<u64, usize> = HashMap::new();
    for delivery in log.deliveries().await {
        for seq in delivery.seqs {
            *seen.entry(seq).or_default() += 1;
        }
    }
    assert!(seen.values().all(|count| *count == 1), "{:?}", seen);

    host.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_merged_partition_replaces_both_parents() {
    let container = Arc::new(InMemoryLeaseContainer::new());
    let feed = InMemoryChangeFeed::with_partitions("coll", 2).await;
    let log = DeliveryLog::default();
    push_seqs(&feed, "0", 1..=1).await;
    push_seqs(&feed, "1", 2..=2).await;

    let host = manager(&container, &feed, &log, fast_options("a"));
    host.start().await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || async {
            continuation_of(&host, "0").await.as_deref() == Some("1")
                && continuation_of(&host, "1").await.as_deref() == Some("2")
        })
        .await
    );

    let merged = feed.merge("0", "1").await.unwrap();
    push_seqs(&feed, &merged, 3..=3).await;

    let expected: BTreeSet<u64> = (1..=3).collect();
    assert!(eventually(Duration::from_secs(5), || async { log.delivered_seqs().await == expected }).await);
    assert!(
        eventually(Duration::from_secs(5), || async {
            lease_tokens(&host).await == tokens(&[merged.as_str()])
        })
        .await
    );
    assert!(
        eventually(Duration::from_secs(5), || async {
            host.owned_lease_tokens() == vec![merged.clone()]
        })
        .await
    );

    host.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_splits_while_two_hosts_process() {
    let container = Arc::new(InMemoryLeaseContainer::new());
    let feed = InMemoryChangeFeed::with_partitions("coll", 2).await;
    let log = DeliveryLog::default();
    push_seqs(&feed, "0", 1..=10).await;
    push_seqs(&feed, "1", 11..=20).await;

    let a = manager(&container, &feed, &log, fast_options("a"));
    let b = manager(&container, &feed, &log, fast_options("b"));
    a.start().await.unwrap();
    b.start().await.unwrap();

    let first_wave: BTreeSet<u64> = (1..=20).collect();
    assert!(eventually(Duration::from_secs(10), || async { log.delivered_seqs().await == first_wave }).await);

    let mut seq = 20;
    for parent in ["0", "1"] {
        let (left, right) = feed.split(parent).await.unwrap();
        push_seqs(&feed, &left, seq + 1..=seq + 5).await;
        push_seqs(&feed, &right, seq + 6..=seq + 10).await;
        seq += 10;
    }

    let everything: BTreeSet<u64> = (1..=seq).collect();
    assert!(eventually(Duration::from_secs(10), || async { log.delivered_seqs().await == everything }).await);
    assert!(
        eventually(Duration::from_secs(10), || async {
            a.owned_lease_tokens().len() == 2 && b.owned_lease_tokens().len() == 2
        })
        .await
    );
    assert_eq!(lease_tokens(&a).await.len(), 4);
    assert!(!lease_tokens(&a).await.contains("0"));
    assert!(!lease_tokens(&a).await.contains("1"));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
