//! Lease-based distribution of change-feed partitions across hosts.
//!
//! Every partition of the monitored collection is governed by one lease
//! document in a shared [`LeaseContainer`]. Hosts compete for leases with
//! etag-conditional writes, process the partitions they own and checkpoint
//! progress into the lease.
//!
//! # Architecture
//!
//! ```text
//!  PartitionManager
//!   ├── Bootstrapper ──► PartitionSynchronizer ──► LeaseStoreManager ──► LeaseContainer
//!   └── PartitionLoadBalancer (periodic)
//!         ├── LoadBalancingStrategy          (which leases to take)
//!         └── PartitionController            (health-monitored)
//!               └── PartitionSupervisor      (one task per owned lease)
//!                     ├── PartitionProcessor ──► ChangeFeedSource ──► ChangeFeedObserver
//!                     └── LeaseRenewer
//! ```
//!
//! # Module Organization
//!
//! - [`traits`]: seams to the lease container, data source and observers
//! - [`lease`], [`lease_store`], [`lease_manager`]: lease documents and CRUD
//! - [`synchronizer`], [`bootstrapper`]: lease creation, splits and merges
//! - [`balancing`], [`load_balancer`]: deciding and executing acquisition
//! - [`controller`], [`supervisor`], [`processor`], [`renewer`], [`checkpointer`]:
//!   per-partition runtime
//! - [`health`]: controller decorator reporting faults
//! - [`partition_manager`]: host entry point
//! - [`config`], [`error`], [`metrics`], [`observability`], [`retry`]: ambient concerns

pub mod balancing;
pub mod bootstrapper;
pub mod checkpointer;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod lease;
pub mod lease_manager;
pub mod lease_store;
pub mod load_balancer;
#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;
pub mod metrics;
pub mod observability;
pub mod partition_manager;
pub mod processor;
pub mod renewer;
pub mod retry;
pub mod supervisor;
pub mod synchronizer;
pub mod traits;

pub use balancing::EqualPartitionsBalancingStrategy;
pub use bootstrapper::{BootstrapSettings, BootstrapState, Bootstrapper};
pub use checkpointer::{CheckpointFrequency, CheckpointTracker, LeaseCheckpointer};
pub use config::ProcessorOptions;
pub use controller::PartitionControllerImpl;
pub use error::{ErrorDisposition, FeedError, FeedResult, ObserverError};
pub use health::{
    HealthMonitor, HealthMonitoringPartitionController, HealthMonitoringRecord, HealthSeverity,
    MonitoredOperation, TracingHealthMonitor,
};
pub use lease::{Lease, LeaseState};
pub use lease_manager::LeaseStoreManager;
pub use lease_store::LeaseStore;
pub use load_balancer::PartitionLoadBalancer;
#[cfg(any(test, feature = "test-utilities"))]
pub use memory::{InMemoryChangeFeed, InMemoryLeaseContainer};
pub use partition_manager::{ManagerState, PartitionManager, PartitionManagerBuilder};
pub use processor::{PartitionProcessor, ProcessorSettings, ProcessorState};
pub use renewer::{LeaseRenewer, RenewalState};
pub use supervisor::{PartitionSupervisor, SupervisorOutcome};
pub use synchronizer::PartitionSynchronizer;
pub use traits::{
    ChangeFeedObserver, ChangeFeedObserverFactory, ChangeFeedSource, CloseReason, LeaseContainer,
    LoadBalancingStrategy, ObserverContext, PartitionCheckpointer, PartitionController,
    StoredDocument, compare_continuations,
};
