//! Per-partition pull loop.
//!
//! ```text
//!            ┌──────────── empty page: sleep feed_poll_delay ───┐
//!            ▼                                                   │
//!        Polling ──── page ────► Dispatching ──── due ────► Checkpointing
//!         │  ▲                        │                          │
//!         │  └──── not due ───────────┘◄─────────────────────────┘
//!         │
//!         └── Gone / LeaseLost / fatal ──► Terminated
//! ```
//!
//! Errors from the data source are handled by [`FeedError::classify`]:
//!
//! | Disposition | Action |
//! |-------------|--------|
//! | `RetryAfter(d)` | sleep `d`, poll again |
//! | `ShrinkPage` | halve the page size and poll again; fatal at size 1 |
//! | `Gone`, `LeaseLost`, `Cancelled`, `Fatal` | terminate with the error |
//!
//! Cancellation is checked at the top of every step and aborts any sleep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::checkpointer::CheckpointTracker;
use super::config::ProcessorOptions;
use super::error::{ErrorDisposition, FeedError, FeedResult};
use super::lease::Lease;
use super::metrics;
use super::traits::{ChangeFeedObserver, ChangeFeedSource, ObserverContext, PartitionCheckpointer};
use crate::types::{ChangeFeedPage, ChangeFeedRequest, StartFrom};

/// Per-processor settings, derived from the lease and the options at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub partition_token: String,
    pub start_continuation: Option<String>,
    pub feed_poll_delay: Duration,
    pub max_item_count: usize,
    pub start_from: StartFrom,
}

impl ProcessorSettings {
    pub fn from_lease(lease: &Lease, options: &ProcessorOptions) -> Self {
        Self {
            partition_token: lease.lease_token.clone(),
            start_continuation: lease.continuation_token.clone(),
            feed_poll_delay: options.feed_poll_delay,
            max_item_count: options.max_item_count,
            start_from: options.start_from,
        }
    }
}

/// Step of the processing loop.
#[derive(Debug)]
pub enum ProcessorState {
    /// Requesting the next page.
    Polling,
    /// Handing a page to the observer.
    Dispatching(ChangeFeedPage),
    /// Persisting the continuation that follows the dispatched page.
    Checkpointing(String),
    /// Finished; `Ok` means cancelled.
    Terminated(FeedResult<()>),
}

/// Reads one partition and feeds its changes to an observer.
pub struct PartitionProcessor<S: ChangeFeedSource> {
    source: Arc<S>,
    settings: ProcessorSettings,
    checkpointer: Arc<dyn PartitionCheckpointer>,
    tracker: CheckpointTracker,
    continuation: Option<String>,
    page_size: usize,
}

impl<S: ChangeFeedSource> PartitionProcessor<S> {
    pub fn new(
        source: Arc<S>,
        settings: ProcessorSettings,
        checkpointer: Arc<dyn PartitionCheckpointer>,
        tracker: CheckpointTracker,
    ) -> Self {
        let continuation = settings.start_continuation.clone();
        let page_size = settings.max_item_count.max(1);
        Self {
            source,
            settings,
            checkpointer,
            tracker,
            continuation,
            page_size,
        }
    }

    /// Continuation that follows the last page read.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Current page size; below `max_item_count` after `PageTooLarge`.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Run until cancelled (`Ok`) or a terminal error.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        observer: &dyn ChangeFeedObserver,
    ) -> FeedResult<()> {
        let mut state = ProcessorState::Polling;
        loop {
            state = match state {
                ProcessorState::Terminated(result) => return result,
                _ if cancel.is_cancelled() => return Ok(()),
                ProcessorState::Polling => self.poll(cancel).await,
                ProcessorState::Dispatching(page) => self.dispatch(page, observer).await,
                ProcessorState::Checkpointing(continuation) => self.checkpoint(&continuation).await,
            };
        }
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> ProcessorState {
        let request = ChangeFeedRequest {
            partition_token: self.settings.partition_token.clone(),
            continuation: self.continuation.clone(),
            max_item_count: self.page_size,
            start_from: self.settings.start_from,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return ProcessorState::Terminated(Ok(())),
            result = self.source.query_changes(&request) => result,
        };

        match result {
            Ok(page) => {
                self.page_size = self.settings.max_item_count.max(1);
                if page.is_empty() {
                    metrics::record_page("empty");
                    self.continuation = Some(page.continuation);
                    return self.sleep(cancel, self.settings.feed_poll_delay).await;
                }
                metrics::record_page("changes");
                ProcessorState::Dispatching(page)
            }
            Err(e) => self.handle_error(cancel, e).await,
        }
    }

    async fn handle_error(&mut self, cancel: &CancellationToken, error: FeedError) -> ProcessorState {
        let disposition = error.classify();
        metrics::record_processor_error(disposition.as_metric_label());
        match disposition {
            ErrorDisposition::RetryAfter(delay) => {
                debug!(delay = ?delay, "Throttled, backing off");
                self.sleep(cancel, delay).await
            }
            ErrorDisposition::ShrinkPage => {
                if self.page_size <= 1 {
                    warn!("Page too large even at a single item");
                    return ProcessorState::Terminated(Err(error));
                }
                self.page_size = (self.page_size / 2).max(1);
                debug!(page_size = self.page_size, "Page too large, shrinking");
                ProcessorState::Polling
            }
            ErrorDisposition::Gone => ProcessorState::Terminated(Err(error)),
            ErrorDisposition::LeaseLost => ProcessorState::Terminated(Err(error)),
            ErrorDisposition::Cancelled => ProcessorState::Terminated(Ok(())),
            ErrorDisposition::Fatal => {
                warn!(error = %error, "Unrecoverable error reading the change feed");
                ProcessorState::Terminated(Err(error))
            }
        }
    }

    async fn dispatch(
        &mut self,
        page: ChangeFeedPage,
        observer: &dyn ChangeFeedObserver,
    ) -> ProcessorState {
        let documents = page.len();
        let context = ObserverContext::new(
            self.settings.partition_token.clone(),
            Some(page.continuation.clone()),
            self.checkpointer.clone(),
        );

        let started = Instant::now();
        let result = observer.process_changes(&context, page.documents).await;
        let elapsed = started.elapsed().as_secs_f64();

        if let Err(e) = result {
            metrics::record_observer_duration("error", elapsed);
            return ProcessorState::Terminated(Err(FeedError::Observer {
                lease_token: self.settings.partition_token.clone(),
                message: e.to_string(),
            }));
        }
        metrics::record_observer_duration("success", elapsed);
        metrics::record_documents_processed(documents);

        self.continuation = Some(page.continuation.clone());
        if self.tracker.record_batch(documents) {
            ProcessorState::Checkpointing(page.continuation)
        } else {
            ProcessorState::Polling
        }
    }

    async fn checkpoint(&mut self, continuation: &str) -> ProcessorState {
        match self.checkpointer.checkpoint(continuation).await {
            Ok(()) => {
                self.tracker.reset();
                ProcessorState::Polling
            }
            Err(e) => ProcessorState::Terminated(Err(e)),
        }
    }

    async fn sleep(&self, cancel: &CancellationToken, delay: Duration) -> ProcessorState {
        tokio::select! {
            _ = cancel.cancelled() => ProcessorState::Terminated(Ok(())),
            _ = tokio::time::sleep(delay) => ProcessorState::Polling,
        }
    }
}
