//! Prometheus metrics for the change-feed engine.
//!
//! Metrics cover:
//! - Lease operations (acquire, renew, release, checkpoint) and their outcome
//! - Partition processing (pages, documents, errors by disposition)
//! - Load balancing (ticks, leases taken, owned lease count)
//! - Bootstrap (lock attempts, synchronizations)
//! - Partition reconciliation (leases created and deleted by splits/merges)
//!
//! # Registry
//!
//! Everything lives in [`REGISTRY`], whose names carry the `changefeed_`
//! prefix, so embedding hosts can export it next to their own registry.
//! Each metric is created on first use. If the registry rejects one (a
//! duplicate name, for instance) the clash is logged and the metric keeps
//! counting, it is just not exported.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Registry holding every change-feed metric.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("changefeed".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Add `metric` to [`REGISTRY`] and hand it back either way.
fn registered<M>(metric: M, name: &str) -> M
where
    M: Collector + Clone + 'static,
{
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        warn!(metric = name, error = %e, "Metric rejected by registry, it will not be exported");
    }
    metric
}

// Definitions below are static, so construction only fails on a typo.

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("static gauge definition")
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("static counter definition")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(opts!(name, help), labels).expect("static counter definition")
}

fn histogram_vec(name: &str, help: &str, labels: &[&str], buckets: Vec<f64>) -> HistogramVec {
    HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("static histogram definition")
}

/// Declares a lazily registered metric.
macro_rules! exported {
    ($(#[$meta:meta])* $name:ident: $ty:ty = $metric:expr) => {
        $(#[$meta])*
        pub static $name: Lazy<$ty> = Lazy::new(|| registered($metric, stringify!($name)));
    };
}

// =============================================================================
// Leases
// =============================================================================

exported!(
    /// Lease mutations by operation and outcome ("success", "lost", "error").
    LEASE_OPERATIONS: IntCounterVec = counter_vec(
        "lease_operations_total",
        "Lease mutations by operation and outcome",
        &["operation", "status"],
    )
);
exported!(
    /// Leases with a running supervisor on this host.
    OWNED_LEASES: IntGauge = gauge("owned_leases", "Leases with a running supervisor on this host")
);
exported!(
    /// Mutations re-applied after an etag conflict.
    LEASE_CONFLICT_RETRIES: IntCounter = counter(
        "lease_conflict_retries_total",
        "Lease mutations re-applied after an etag conflict",
    )
);

// =============================================================================
// Partition processing
// =============================================================================

exported!(
    /// Pages read, split into "changes" and "empty".
    PAGES_READ: IntCounterVec = counter_vec(
        "pages_read_total",
        "Change feed pages read, by result",
        &["result"],
    )
);
exported!(
    /// Documents the observer accepted.
    DOCUMENTS_PROCESSED: IntCounter = counter(
        "documents_processed_total",
        "Documents handled successfully by observers",
    )
);
exported!(
    PROCESSOR_ERRORS: IntCounterVec = counter_vec(
        "processor_errors_total",
        "Change feed read errors, by disposition",
        &["disposition"],
    )
);
exported!(
    /// Observer `process_changes` latency.
    OBSERVER_DURATION: HistogramVec = histogram_vec(
        "observer_duration_seconds",
        "Observer process_changes latency",
        &["status"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
    )
);
exported!(
    SUPERVISOR_EXITS: IntCounterVec = counter_vec(
        "supervisor_exits_total",
        "Partition supervisors that stopped, by close reason",
        &["reason"],
    )
);

// =============================================================================
// Balancing, bootstrap and reconciliation
// =============================================================================

exported!(
    BALANCER_TICKS: IntCounter = counter("balancer_ticks_total", "Load balancer evaluations")
);
exported!(
    LEASES_TAKEN: IntCounter = counter("leases_taken_total", "Leases acquired by the load balancer")
);
exported!(
    BOOTSTRAP_EVENTS: IntCounterVec = counter_vec(
        "bootstrap_events_total",
        "Bootstrap lock attempts and synchronizations",
        &["event"],
    )
);
exported!(
    /// Leases created or deleted while reconciling partition ranges.
    SYNCHRONIZER_LEASES: IntCounterVec = counter_vec(
        "synchronizer_leases_total",
        "Leases created or deleted by partition reconciliation",
        &["action"],
    )
);
exported!(
    HEALTH_RECORDS: IntCounterVec = counter_vec(
        "health_records_total",
        "Health monitoring records, by severity",
        &["severity"],
    )
);

/// Force registration of every metric.
///
/// Idempotent. Metrics are otherwise registered lazily on first use, which
/// means they are missing from `encode_metrics()` until then.
pub fn init_metrics() {
    let _ = &*LEASE_OPERATIONS;
    let _ = &*OWNED_LEASES;
    let _ = &*LEASE_CONFLICT_RETRIES;
    let _ = &*PAGES_READ;
    let _ = &*DOCUMENTS_PROCESSED;
    let _ = &*PROCESSOR_ERRORS;
    let _ = &*OBSERVER_DURATION;
    let _ = &*SUPERVISOR_EXITS;
    let _ = &*BALANCER_TICKS;
    let _ = &*LEASES_TAKEN;
    let _ = &*BOOTSTRAP_EVENTS;
    let _ = &*SYNCHRONIZER_LEASES;
    let _ = &*HEALTH_RECORDS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a lease operation.
pub fn record_lease_operation(operation: &str, status: &str) {
    LEASE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record the number of leases processed by this host.
pub fn set_owned_leases(count: usize) {
    OWNED_LEASES.set(count as i64);
}

/// Record an etag conflict that was resolved by re-applying a mutation.
pub fn record_conflict_retry() {
    LEASE_CONFLICT_RETRIES.inc();
}

/// Record a page read; `result` is "changes" or "empty".
pub fn record_page(result: &str) {
    PAGES_READ.with_label_values(&[result]).inc();
}

/// Record documents the observer finished without error.
pub fn record_documents_processed(documents: usize) {
    DOCUMENTS_PROCESSED.inc_by(documents as u64);
}

/// Record a classified processor error.
pub fn record_processor_error(disposition: &str) {
    PROCESSOR_ERRORS.with_label_values(&[disposition]).inc();
}

/// Record an observer callback duration.
pub fn record_observer_duration(status: &str, duration_secs: f64) {
    OBSERVER_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Record a supervisor exit.
pub fn record_supervisor_exit(reason: &str) {
    SUPERVISOR_EXITS.with_label_values(&[reason]).inc();
}

/// Record one load balancer evaluation and how many leases it took.
pub fn record_balancer_tick(taken: usize) {
    BALANCER_TICKS.inc();
    LEASES_TAKEN.inc_by(taken as u64);
}

/// Record a bootstrap event ("lock_acquired", "lock_busy", "synchronized", "already_initialized").
pub fn record_bootstrap_event(event: &str) {
    BOOTSTRAP_EVENTS.with_label_values(&[event]).inc();
}

/// Record leases created or deleted by the synchronizer.
pub fn record_synchronizer_leases(action: &str, count: usize) {
    SYNCHRONIZER_LEASES
        .with_label_values(&[action])
        .inc_by(count as u64);
}

/// Record a health monitoring record.
pub fn record_health(severity: &str) {
    HEALTH_RECORDS.with_label_values(&[severity]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_encode_metrics_uses_prefix() {
        record_lease_operation("acquire", "success");
        let text = encode_metrics().unwrap();
        assert!(text.contains("changefeed_lease_operations_total"));
    }

    #[test]
    fn test_counters_increment() {
        let before = LEASE_OPERATIONS
            .with_label_values(&["renew", "conflict"])
            .get();
        record_lease_operation("renew", "conflict");
        let after = LEASE_OPERATIONS
            .with_label_values(&["renew", "conflict"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_page_reads_do_not_count_documents() {
        let pages = PAGES_READ.with_label_values(&["changes"]).get();
        record_page("changes");
        assert!(PAGES_READ.with_label_values(&["changes"]).get() > pages);

        let before = DOCUMENTS_PROCESSED.get();
        record_documents_processed(3);
        assert!(DOCUMENTS_PROCESSED.get() >= before + 3);
    }

    #[test]
    fn test_rejected_metric_still_counts() {
        init_metrics();
        let duplicate = registered(
            counter("balancer_ticks_total", "duplicate name"),
            "DUPLICATE",
        );
        duplicate.inc();
        assert_eq!(duplicate.get(), 1);
    }
}
