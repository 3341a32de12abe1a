//! # changefeed
//! Lease-based partition distribution for consuming partitioned change feeds.
//!
//! Many hosts cooperate to read one partitioned change feed. Each partition is
//! owned by exactly one host at a time through a lease document kept in a
//! shared store; hosts balance leases among themselves, survive crashes of
//! their peers, follow partition splits and merges, and resume from the last
//! checkpoint with at-least-once delivery.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/) and [tracing](https://docs.rs/tracing)
//! - Keep the store and the data source behind small async traits
//!
//! ## Getting started
//! Implement [`LeaseContainer`](feed::LeaseContainer) for your document store,
//! [`ChangeFeedSource`](feed::ChangeFeedSource) for your data source and
//! [`ChangeFeedObserver`](feed::ChangeFeedObserver) for your business logic,
//! then run a [`PartitionManager`](feed::PartitionManager) on every host.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use changefeed::prelude::*;
//!
//! struct PrintObserver;
//!
//! #[async_trait]
//! impl ChangeFeedObserver for PrintObserver {
//!     async fn process_changes(
//!         &self,
//!         context: &ObserverContext,
//!         documents: Vec<Document>,
//!     ) -> Result<(), ObserverError> {
//!         println!("{}: {} changes", context.lease_token(), documents.len());
//!         Ok(())
//!     }
//! }
//!
//! async fn run<C, S>(container: Arc<C>, source: Arc<S>) -> FeedResult<()>
//! where
//!     C: LeaseContainer + 'static,
//!     S: ChangeFeedSource + 'static,
//! {
//!     let manager = PartitionManager::new(
//!         container,
//!         source,
//!         Arc::new(|| PrintObserver),
//!         ProcessorOptions::new("host-1"),
//!     )?;
//!     manager.start().await?;
//!     tokio::time::sleep(Duration::from_secs(3600)).await;
//!     manager.stop().await
//! }
//! ```

#![forbid(unsafe_code)]

pub mod constants;
pub mod feed;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Everything needed to plug a store, a data source and an observer into
    //! a [`PartitionManager`].
    pub use crate::feed::{
        ChangeFeedObserver, ChangeFeedObserverFactory, ChangeFeedSource, CheckpointFrequency,
        CloseReason, FeedError, FeedResult, Lease, LeaseContainer, LeaseState, ObserverContext,
        ObserverError, PartitionManager, ProcessorOptions, StoredDocument,
    };
    pub use crate::types::{
        ChangeFeedPage, ChangeFeedRequest, Document, FeedRange, PartitionRange, StartFrom,
    };
}
