//! Health monitoring around a [`PartitionController`].
//!
//! [`HealthMonitoringPartitionController`] forwards every call to the wrapped
//! controller and hands a [`HealthMonitoringRecord`] to a [`HealthMonitor`]
//! for each notable outcome. Return values pass through unchanged.
//!
//! | Operation | Success | Failure |
//! |-----------|---------|---------|
//! | `initialize` | - | `Critical` |
//! | `add_or_update_lease` | `Informational` | `Error` (`LeaseLost` is not reported) |
//! | `release_expired_own_leases` | `Informational` if any were torn down | `Error` |
//! | `shutdown_lease` | - | `Error` |
//! | `shutdown` | - | `Critical` |

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::error::FeedResult;
use super::lease::Lease;
use super::metrics;
use super::traits::PartitionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSeverity {
    Informational,
    Error,
    Critical,
}

impl HealthSeverity {
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            HealthSeverity::Informational => "informational",
            HealthSeverity::Error => "error",
            HealthSeverity::Critical => "critical",
        }
    }
}

/// Controller operation a record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoredOperation {
    Initialize,
    AcquireLease,
    ReleaseExpiredLeases,
    ShutdownLease,
    Shutdown,
}

impl fmt::Display for MonitoredOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitoredOperation::Initialize => write!(f, "initialize"),
            MonitoredOperation::AcquireLease => write!(f, "acquire_lease"),
            MonitoredOperation::ReleaseExpiredLeases => write!(f, "release_expired_leases"),
            MonitoredOperation::ShutdownLease => write!(f, "shutdown_lease"),
            MonitoredOperation::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One observation reported to a [`HealthMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMonitoringRecord {
    pub severity: HealthSeverity,
    pub operation: MonitoredOperation,
    /// Lease the operation concerned, if any.
    pub lease_token: Option<String>,
    /// Rendered error for failures.
    pub error: Option<String>,
}

impl HealthMonitoringRecord {
    fn new(
        severity: HealthSeverity,
        operation: MonitoredOperation,
        lease_token: Option<&str>,
        error: Option<String>,
    ) -> Self {
        Self {
            severity,
            operation,
            lease_token: lease_token.map(str::to_string),
            error,
        }
    }
}

/// Receives health records.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn inspect(&self, record: HealthMonitoringRecord);
}

#[async_trait]
impl<M: HealthMonitor + ?Sized> HealthMonitor for Arc<M> {
    async fn inspect(&self, record: HealthMonitoringRecord) {
        (**self).inspect(record).await
    }
}

/// Logs records through `tracing` and counts them by severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHealthMonitor;

#[async_trait]
impl HealthMonitor for TracingHealthMonitor {
    async fn inspect(&self, record: HealthMonitoringRecord) {
        metrics::record_health(record.severity.as_metric_label());
        let lease_token = record.lease_token.as_deref().unwrap_or("-");
        let error = record.error.as_deref().unwrap_or("");
        match record.severity {
            HealthSeverity::Informational => {
                info!(operation = %record.operation, lease_token, "Health")
            }
            HealthSeverity::Error => {
                warn!(operation = %record.operation, lease_token, error, "Health")
            }
            HealthSeverity::Critical => {
                error!(operation = %record.operation, lease_token, error, "Health")
            }
        }
    }
}

/// Decorates a controller with health reporting.
pub struct HealthMonitoringPartitionController<P, M> {
    inner: P,
    monitor: M,
}

impl<P: PartitionController, M: HealthMonitor> HealthMonitoringPartitionController<P, M> {
    pub fn new(inner: P, monitor: M) -> Self {
        Self { inner, monitor }
    }

    /// The wrapped controller.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    async fn report(
        &self,
        severity: HealthSeverity,
        operation: MonitoredOperation,
        lease_token: Option<&str>,
        error: Option<String>,
    ) {
        self.monitor
            .inspect(HealthMonitoringRecord::new(
                severity,
                operation,
                lease_token,
                error,
            ))
            .await;
    }
}

#[async_trait]
impl<P: PartitionController, M: HealthMonitor> PartitionController
    for HealthMonitoringPartitionController<P, M>
{
    async fn initialize(&self) -> FeedResult<()> {
        let result = self.inner.initialize().await;
        if let Err(e) = &result {
            self.report(
                HealthSeverity::Critical,
                MonitoredOperation::Initialize,
                None,
                Some(e.to_string()),
            )
            .await;
        }
        result
    }

    async fn add_or_update_lease(&self, lease: Lease) -> FeedResult<()> {
        let lease_token = lease.lease_token.clone();
        let result = self.inner.add_or_update_lease(lease).await;
        match &result {
            Ok(()) => {
                self.report(
                    HealthSeverity::Informational,
                    MonitoredOperation::AcquireLease,
                    Some(&lease_token),
                    None,
                )
                .await
            }
            Err(e) if e.is_lease_lost() => {}
            Err(e) => {
                self.report(
                    HealthSeverity::Error,
                    MonitoredOperation::AcquireLease,
                    Some(&lease_token),
                    Some(e.to_string()),
                )
                .await
            }
        }
        result
    }

    async fn release_expired_own_leases(&self) -> FeedResult<usize> {
        let result = self.inner.release_expired_own_leases().await;
        match &result {
            Ok(0) => {}
            Ok(count) => {
                self.report(
                    HealthSeverity::Informational,
                    MonitoredOperation::ReleaseExpiredLeases,
                    None,
                    Some(format!("{} supervisors stopped", count)),
                )
                .await
            }
            Err(e) => {
                self.report(
                    HealthSeverity::Error,
                    MonitoredOperation::ReleaseExpiredLeases,
                    None,
                    Some(e.to_string()),
                )
                .await
            }
        }
        result
    }

    async fn shutdown_lease(&self, lease_token: &str) -> FeedResult<()> {
        let result = self.inner.shutdown_lease(lease_token).await;
        if let Err(e) = &result {
            self.report(
                HealthSeverity::Error,
                MonitoredOperation::ShutdownLease,
                Some(lease_token),
                Some(e.to_string()),
            )
            .await;
        }
        result
    }

    async fn shutdown(&self) -> FeedResult<()> {
        let result = self.inner.shutdown().await;
        if let Err(e) = &result {
            self.report(
                HealthSeverity::Critical,
                MonitoredOperation::Shutdown,
                None,
                Some(e.to_string()),
            )
            .await;
        }
        result
    }

    fn owned_lease_tokens(&self) -> Vec<String> {
        self.inner.owned_lease_tokens()
    }
}
