//! Value types shared between the engine and the change-feed data source.
//!
//! These types describe what the data source hands to the engine (partition
//! ranges, pages of changes) and what the engine asks of it (page requests).
//! They are deliberately plain: the engine never interprets documents or
//! continuation tokens beyond ordering them through
//! [`ChangeFeedSource::earliest_continuation`](crate::feed::ChangeFeedSource::earliest_continuation).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single change delivered by the feed.
pub type Document = serde_json::Value;

/// A contiguous key range `[min_inclusive, max_exclusive)` of the collection.
///
/// Bounds are compared lexicographically. An empty `max_exclusive` is not
/// special; callers use a sentinel such as `"FF"` for the upper end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRange {
    /// Inclusive lower bound.
    pub min_inclusive: String,
    /// Exclusive upper bound.
    pub max_exclusive: String,
}

impl FeedRange {
    /// Create a new range.
    pub fn new(min_inclusive: impl Into<String>, max_exclusive: impl Into<String>) -> Self {
        Self {
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
        }
    }

    /// Returns true if the two ranges share at least one key.
    pub fn overlaps(&self, other: &FeedRange) -> bool {
        self.min_inclusive < other.max_exclusive && other.min_inclusive < self.max_exclusive
    }

    /// Returns true if `other` lies entirely within this range.
    pub fn contains(&self, other: &FeedRange) -> bool {
        self.min_inclusive <= other.min_inclusive && other.max_exclusive <= self.max_exclusive
    }
}

impl fmt::Display for FeedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min_inclusive, self.max_exclusive)
    }
}

/// A partition key range as listed by the data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionRange {
    /// Partition token identifying this range.
    pub id: String,
    /// Key range covered by the partition.
    pub feed_range: FeedRange,
    /// Tokens of the ranges this one was split or merged from, if known.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionRange {
    /// Create a range with no known parents.
    pub fn new(id: impl Into<String>, feed_range: FeedRange) -> Self {
        Self {
            id: id.into(),
            feed_range,
            parents: Vec::new(),
        }
    }
}

/// Where to start reading a partition that has no continuation token yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartFrom {
    /// Only changes made after the first read.
    #[default]
    Now,
    /// Every change retained by the feed.
    Beginning,
    /// Changes made at or after the given instant.
    Time(DateTime<Utc>),
}

/// A request for one page of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedRequest {
    /// Partition to read.
    pub partition_token: String,
    /// Resume point; `None` means "use `start_from`".
    pub continuation: Option<String>,
    /// Upper bound on the number of documents in the page.
    pub max_item_count: usize,
    /// Start position used only when `continuation` is `None`.
    pub start_from: StartFrom,
}

/// One page of changes returned by the data source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeFeedPage {
    /// Changes in feed order.
    pub documents: Vec<Document>,
    /// Token to pass in the next request to continue after this page.
    pub continuation: String,
}

impl ChangeFeedPage {
    /// Returns true if the page carries no changes.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Number of documents in the page.
    pub fn len(&self) -> usize {
        self.documents.len()
    }
}
