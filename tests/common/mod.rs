//! Shared fixtures for the multi-host integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use changefeed::feed::{
    ChangeFeedObserver, FeedResult, InMemoryChangeFeed, InMemoryLeaseContainer, ObserverContext,
    ObserverError, PartitionManager, ProcessorOptions,
};
use changefeed::types::{Document, StartFrom};
use serde_json::json;
use tokio::sync::Mutex;

pub type Manager = PartitionManager<InMemoryLeaseContainer, InMemoryChangeFeed>;

/// One delivered batch: host, lease token and document sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub host: String,
    pub lease_token: String,
    pub seqs: Vec<u64>,
}

/// Observer recording every batch it sees into a shared log.
#[derive(Clone)]
pub struct RecordingObserver {
    host: String,
    log: Arc<Mutex<Vec<Delivery>>>,
}

#[async_trait]
impl ChangeFeedObserver for RecordingObserver {
    async fn process_changes(
        &self,
        context: &ObserverContext,
        documents: Vec<Document>,
    ) -> Result<(), ObserverError> {
        let seqs = documents
            .iter()
            .filter_map(|d| d.get("seq").and_then(|s| s.as_u64()))
            .collect();
        self.log.lock().await.push(Delivery {
            host: self.host.clone(),
            lease_token: context.lease_token().to_string(),
            seqs,
        });
        Ok(())
    }
}

/// Shared delivery log for every host in a test.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    inner: Arc<Mutex<Vec<Delivery>>>,
}

impl DeliveryLog {
    pub fn observer(&self, host: &str) -> RecordingObserver {
        RecordingObserver {
            host: host.to_string(),
            log: self.inner.clone(),
        }
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.inner.lock().await.clone()
    }

    /// Every distinct sequence number delivered so far.
    pub async fn delivered_seqs(&self) -> BTreeSet<u64> {
        self.inner
            .lock()
            .await
            .iter()
            .flat_map(|d| d.seqs.iter().copied())
            .collect()
    }

    /// Sequence numbers delivered by one host.
    pub async fn seqs_for_host(&self, host: &str) -> Vec<u64> {
        self.inner
            .lock()
            .await
            .iter()
            .filter(|d| d.host == host)
            .flat_map(|d| d.seqs.iter().copied())
            .collect()
    }

    /// Lease tokens that received at least one batch.
    pub async fn lease_tokens(&self) -> BTreeSet<String> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|d| d.lease_token.clone())
            .collect()
    }
}

/// Options with timings short enough for paused-clock tests.
pub fn fast_options(host: &str) -> ProcessorOptions {
    let mut options = ProcessorOptions::new(host);
    options.lease_renew_interval = Duration::from_millis(100);
    options.lease_expiration_interval = Duration::from_secs(1);
    options.lease_acquire_interval = Duration::from_millis(200);
    options.feed_poll_delay = Duration::from_millis(50);
    options.bootstrap_sleep_time = Duration::from_millis(50);
    options.start_from = StartFrom::Beginning;
    options
}

pub fn manager(
    container: &Arc<InMemoryLeaseContainer>,
    feed: &InMemoryChangeFeed,
    log: &DeliveryLog,
    options: ProcessorOptions,
) -> Manager {
    let observer = log.observer(&options.host_name);
    PartitionManager::new(
        container.clone(),
        Arc::new(feed.clone()),
        Arc::new(move || observer.clone()),
        options,
    )
    .expect("valid options")
}

/// Push documents `{"seq": n}` for every `n` in `seqs` to one partition.
pub async fn push_seqs(feed: &InMemoryChangeFeed, partition: &str, seqs: impl IntoIterator<Item = u64>) {
    for seq in seqs {
        feed.push(partition, json!({ "seq": seq }))
            .await
            .expect("partition exists");
    }
}

/// Poll `condition` every 50ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Stop every manager, failing the test on error.
pub async fn stop_all(managers: &[&Manager]) -> FeedResult<()> {
    for manager in managers {
        manager.stop().await?;
    }
    Ok(())
}
