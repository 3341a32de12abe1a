//! In-memory collaborators for testing.
//!
//! [`InMemoryLeaseContainer`] implements the full [`LeaseContainer`] contract
//! (etags, conditional writes, TTL expiry) and [`InMemoryChangeFeed`] the full
//! [`ChangeFeedSource`] contract, including partition splits and merges and
//! fault injection (throttling, oversized pages, read failures).
//!
//! Both are cheap to clone; clones share state, so several hosts in one test
//! can point at the same container and feed.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! changefeed = { path = ".", features = ["test-utilities"] }
//! ```
//!
//! Continuation tokens of the in-memory feed are decimal sequence numbers
//! that are global to the feed, so they stay comparable across splits and
//! merges.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::error::{FeedError, FeedResult};
use super::traits::{ChangeFeedSource, LeaseContainer, StoredDocument};
use crate::types::{
    ChangeFeedPage, ChangeFeedRequest, Document, FeedRange, PartitionRange, StartFrom,
};

// =============================================================================
// Lease container
// =============================================================================

#[derive(Debug, Clone)]
struct StoredEntry {
    document: StoredDocument,
    written_at: Instant,
}

impl StoredEntry {
    fn is_live(&self) -> bool {
        self.document
            .ttl
            .is_none_or(|ttl| self.written_at.elapsed() < ttl)
    }
}

/// In-memory document store with etags and TTL expiry.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseContainer {
    documents: Arc<RwLock<BTreeMap<String, StoredEntry>>>,
    next_etag: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLeaseContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    fn new_etag(&self) -> String {
        format!("\"{}\"", self.next_etag.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_available(&self) -> FeedResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FeedError::Store("lease container unavailable".to_string()));
        }
        Ok(())
    }

    /// Make every operation fail with `FeedError::Store` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful writes (create, replace, delete).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Ids of every live document, sorted.
    pub async fn document_ids(&self) -> Vec<String> {
        let documents = self.documents.read().await;
        documents
            .values()
            .filter(|e| e.is_live())
            .map(|e| e.document.id.clone())
            .collect()
    }

    /// Mutate a document body in place, bypassing etag checks.
    ///
    /// Simulates writes by a foreign host. Returns false if the document does
    /// not exist.
    pub async fn mutate<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut serde_json::Value),
    {
        let mut documents = self.documents.write().await;
        match documents.get_mut(id) {
            Some(entry) if entry.is_live() => {
                f(&mut entry.document.body);
                entry.document.etag = self.new_etag();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl LeaseContainer for InMemoryLeaseContainer {
    async fn create_if_absent(&self, mut document: StoredDocument) -> FeedResult<StoredDocument> {
        self.check_available()?;
        let mut documents = self.documents.write().await;
        if documents.get(&document.id).is_some_and(StoredEntry::is_live) {
            return Err(FeedError::AlreadyExists { id: document.id });
        }
        document.etag = self.new_etag();
        documents.insert(
            document.id.clone(),
            StoredEntry {
                document: document.clone(),
                written_at: Instant::now(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(document)
    }

    async fn read(&self, id: &str) -> FeedResult<Option<StoredDocument>> {
        self.check_available()?;
        let documents = self.documents.read().await;
        Ok(documents
            .get(id)
            .filter(|e| e.is_live())
            .map(|e| e.document.clone()))
    }

    async fn replace(
        &self,
        mut document: StoredDocument,
        if_match: &str,
    ) -> FeedResult<StoredDocument> {
        self.check_available()?;
        let mut documents = self.documents.write().await;
        let entry = match documents.get_mut(&document.id) {
            Some(entry) if entry.is_live() => entry,
            _ => return Err(FeedError::NotFound { id: document.id }),
        };
        if entry.document.etag != if_match {
            return Err(FeedError::PreconditionFailed { id: document.id });
        }
        document.etag = self.new_etag();
        entry.document = document.clone();
        entry.written_at = Instant::now();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(document)
    }

    async fn delete(&self, id: &str, if_match: Option<&str>) -> FeedResult<bool> {
        self.check_available()?;
        let mut documents = self.documents.write().await;
        let Some(entry) = documents.get(id) else {
            return Ok(false);
        };
        if !entry.is_live() {
            documents.remove(id);
            return Ok(false);
        }
        if let Some(etag) = if_match
            && entry.document.etag != etag
        {
            return Err(FeedError::PreconditionFailed { id: id.to_string() });
        }
        documents.remove(id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn list(&self, id_prefix: &str) -> FeedResult<Vec<StoredDocument>> {
        self.check_available()?;
        let documents = self.documents.read().await;
        Ok(documents
            .range(id_prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(id_prefix))
            .filter(|(_, e)| e.is_live())
            .map(|(_, e)| e.document.clone())
            .collect())
    }
}

// =============================================================================
// Change feed
// =============================================================================

#[derive(Debug, Clone)]
struct Change {
    lsn: u64,
    at: DateTime<Utc>,
    document: Document,
}

#[derive(Debug, Clone)]
struct PartitionLog {
    range: PartitionRange,
    changes: Vec<Change>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retirement {
    Split,
    Merged,
}

#[derive(Debug, Clone, Copy)]
struct Throttle {
    remaining: usize,
    retry_after: Duration,
}

#[derive(Debug, Default)]
struct FeedState {
    partitions: BTreeMap<String, PartitionLog>,
    retired: HashMap<String, Retirement>,
    last_lsn: u64,
    next_partition_id: u64,
    throttles: HashMap<String, Throttle>,
    page_limits: HashMap<String, usize>,
    failures: HashMap<String, FeedError>,
    listing_failure: Option<String>,
}

impl FeedState {
    fn allocate_partition_id(&mut self) -> String {
        let id = self.next_partition_id;
        self.next_partition_id += 1;
        id.to_string()
    }
}

/// In-memory partitioned change feed.
#[derive(Debug, Clone)]
pub struct InMemoryChangeFeed {
    collection_id: String,
    state: Arc<RwLock<FeedState>>,
    queries: Arc<AtomicUsize>,
}

impl InMemoryChangeFeed {
    /// Create a feed with no partitions.
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            state: Arc::new(RwLock::new(FeedState::default())),
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a feed whose key space is divided evenly into `count` partitions
    /// with tokens "0", "1", ...
    pub async fn with_partitions(collection_id: impl Into<String>, count: usize) -> Self {
        let feed = Self::new(collection_id);
        let count = count.max(1);
        for i in 0..count {
            let min = format_bound(i * 0x10000 / count);
            let max = if i + 1 == count {
                "FFFF".to_string()
            } else {
                format_bound((i + 1) * 0x10000 / count)
            };
            feed.add_partition(FeedRange::new(min, max)).await;
        }
        feed
    }

    /// Add a partition covering `range`; returns its token.
    pub async fn add_partition(&self, range: FeedRange) -> String {
        let mut state = self.state.write().await;
        let id = state.allocate_partition_id();
        state.partitions.insert(
            id.clone(),
            PartitionLog {
                range: PartitionRange::new(id.clone(), range),
                changes: Vec::new(),
            },
        );
        id
    }

    /// Append a change to a partition; returns its sequence number.
    pub async fn push(&self, partition_token: &str, document: Document) -> FeedResult<u64> {
        let mut state = self.state.write().await;
        let lsn = state.last_lsn + 1;
        let log = state.partitions.get_mut(partition_token).ok_or_else(|| {
            FeedError::PartitionNotFound {
                partition_token: partition_token.to_string(),
            }
        })?;
        log.changes.push(Change {
            lsn,
            at: Utc::now(),
            document,
        });
        state.last_lsn = lsn;
        Ok(lsn)
    }

    /// Split a partition in two at the midpoint of its range.
    ///
    /// Returns the tokens of the two children.
    pub async fn split(&self, partition_token: &str) -> FeedResult<(String, String)> {
        let mut state = self.state.write().await;
        let parent = state.partitions.remove(partition_token).ok_or_else(|| {
            FeedError::PartitionNotFound {
                partition_token: partition_token.to_string(),
            }
        })?;
        let range = &parent.range.feed_range;
        let low = parse_bound(&range.min_inclusive);
        let high = parse_bound(&range.max_exclusive);
        let mid = format_bound(low + (high - low) / 2);

        let left = state.allocate_partition_id();
        let right = state.allocate_partition_id();
        for (id, child_range) in [
            (left.clone(), FeedRange::new(range.min_inclusive.clone(), mid.clone())),
            (right.clone(), FeedRange::new(mid.clone(), range.max_exclusive.clone())),
        ] {
            let mut partition = PartitionRange::new(id.clone(), child_range);
            partition.parents = vec![partition_token.to_string()];
            state.partitions.insert(
                id,
                PartitionLog {
                    range: partition,
                    changes: Vec::new(),
                },
            );
        }
        state
            .retired
            .insert(partition_token.to_string(), Retirement::Split);
        Ok((left, right))
    }

    /// Merge two adjacent partitions; returns the token of the result.
    pub async fn merge(&self, first: &str, second: &str) -> FeedResult<String> {
        let mut state = self.state.write().await;
        let (a, b) = match (state.partitions.get(first), state.partitions.get(second)) {
            (Some(a), Some(b)) => (a.range.feed_range.clone(), b.range.feed_range.clone()),
            (None, _) => {
                return Err(FeedError::PartitionNotFound {
                    partition_token: first.to_string(),
                });
            }
            (_, None) => {
                return Err(FeedError::PartitionNotFound {
                    partition_token: second.to_string(),
                });
            }
        };
        let merged_range = if a.max_exclusive == b.min_inclusive {
            FeedRange::new(a.min_inclusive, b.max_exclusive)
        } else if b.max_exclusive == a.min_inclusive {
            FeedRange::new(b.min_inclusive, a.max_exclusive)
        } else {
            return Err(FeedError::Source(format!(
                "partitions {} and {} are not adjacent",
                first, second
            )));
        };

        state.partitions.remove(first);
        state.partitions.remove(second);
        let id = state.allocate_partition_id();
        let mut partition = PartitionRange::new(id.clone(), merged_range);
        partition.parents = vec![first.to_string(), second.to_string()];
        state.partitions.insert(
            id.clone(),
            PartitionLog {
                range: partition,
                changes: Vec::new(),
            },
        );
        state.retired.insert(first.to_string(), Retirement::Merged);
        state.retired.insert(second.to_string(), Retirement::Merged);
        Ok(id)
    }

    /// Answer the next `times` queries on a partition with `Throttled`.
    pub async fn throttle(&self, partition_token: &str, times: usize, retry_after: Duration) {
        let mut state = self.state.write().await;
        state.throttles.insert(
            partition_token.to_string(),
            Throttle {
                remaining: times,
                retry_after,
            },
        );
    }

    /// Reject queries on a partition asking for more than `max_item_count` items.
    pub async fn limit_page_size(&self, partition_token: &str, max_item_count: usize) {
        let mut state = self.state.write().await;
        state
            .page_limits
            .insert(partition_token.to_string(), max_item_count);
    }

    /// Fail the next query on a partition with `FeedError::Source(message)`.
    pub async fn fail_next(&self, partition_token: &str, message: impl Into<String>) {
        self.fail_next_with(partition_token, FeedError::Source(message.into()))
            .await;
    }

    /// Fail the next query on a partition with `error`, whatever the listing says.
    pub async fn fail_next_with(&self, partition_token: &str, error: FeedError) {
        let mut state = self.state.write().await;
        state.failures.insert(partition_token.to_string(), error);
    }

    /// Fail the next partition listing with `FeedError::Source(message)`.
    pub async fn fail_next_listing(&self, message: impl Into<String>) {
        self.state.write().await.listing_failure = Some(message.into());
    }

    /// Total number of `query_changes` calls.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Sequence number of the last change pushed to any partition.
    pub async fn head(&self) -> u64 {
        self.state.read().await.last_lsn
    }
}

#[async_trait]
impl ChangeFeedSource for InMemoryChangeFeed {
    fn collection_id(&self) -> &str {
        &self.collection_id
    }

    async fn list_partition_ranges(&self) -> FeedResult<Vec<PartitionRange>> {
        let mut state = self.state.write().await;
        if let Some(message) = state.listing_failure.take() {
            return Err(FeedError::Source(message));
        }
        Ok(state.partitions.values().map(|p| p.range.clone()).collect())
    }

    async fn query_changes(&self, request: &ChangeFeedRequest) -> FeedResult<ChangeFeedPage> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let token = request.partition_token.as_str();
        let mut state = self.state.write().await;

        if let Some(error) = state.failures.remove(token) {
            return Err(error);
        }

        if let Some(throttle) = state.throttles.get_mut(token)
            && throttle.remaining > 0
        {
            throttle.remaining -= 1;
            return Err(FeedError::Throttled {
                retry_after: throttle.retry_after,
            });
        }

        if let Some(limit) = state.page_limits.get(token)
            && request.max_item_count > *limit
        {
            return Err(FeedError::PageTooLarge {
                max_item_count: request.max_item_count,
            });
        }

        let head = state.last_lsn;
        let Some(log) = state.partitions.get(token) else {
            return match state.retired.get(token) {
                Some(Retirement::Split) => Err(FeedError::PartitionSplit {
                    partition_token: token.to_string(),
                }),
                Some(Retirement::Merged) | None => Err(FeedError::PartitionNotFound {
                    partition_token: token.to_string(),
                }),
            };
        };

        let after: Option<u64> = match &request.continuation {
            Some(continuation) => Some(continuation.parse().map_err(|_| {
                FeedError::Source(format!("malformed continuation {:?}", continuation))
            })?),
            None => match request.start_from {
                StartFrom::Beginning => Some(0),
                StartFrom::Now => {
                    return Ok(ChangeFeedPage {
                        documents: Vec::new(),
                        continuation: head.to_string(),
                    });
                }
                StartFrom::Time(_) => None,
            },
        };

        let page: Vec<&Change> = log
            .changes
            .iter()
            .filter(|c| match (after, request.start_from) {
                (Some(after), _) => c.lsn > after,
                (None, StartFrom::Time(t)) => c.at >= t,
                (None, _) => true,
            })
            .take(request.max_item_count)
            .collect();

        let continuation = match page.last() {
            Some(last) => last.lsn.to_string(),
            None => after.unwrap_or(head).to_string(),
        };
        Ok(ChangeFeedPage {
            documents: page.into_iter().map(|c| c.document.clone()).collect(),
            continuation,
        })
    }
}

fn format_bound(value: usize) -> String {
    format!("{:04X}", value)
}

fn parse_bound(value: &str) -> usize {
    usize::from_str_radix(value, 16).unwrap_or(0)
}
