//! Prometheus metrics for settlement-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
pub static SETTLEMENT_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static ACCRUAL_LOCK_CONFLICTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static DB_QUERY_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Install the HTTP metrics recorder and register settlement metrics.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder already installed");
        }
    }

    let registry = Registry::new();

    let operations = IntCounterVec::new(
        Opts::new(
            "settlement_operations_total",
            "Settlement operations by organization, operation and outcome",
        ),
        &["organization_id", "operation", "outcome"],
    )
    .expect("Failed to create settlement_operations_total metric");

    let lock_conflicts = IntCounterVec::new(
        Opts::new(
            "settlement_accrual_lock_conflicts_total",
            "Conditional accrual writes that matched no document",
        ),
        &["operation"],
    )
    .expect("Failed to create settlement_accrual_lock_conflicts_total metric");

    let db_duration = HistogramVec::new(
        HistogramOpts::new(
            "settlement_db_query_duration_seconds",
            "Database query duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["operation"],
    )
    .expect("Failed to create settlement_db_query_duration_seconds metric");

    registry
        .register(Box::new(operations.clone()))
        .expect("Failed to register settlement_operations_total");
    registry
        .register(Box::new(lock_conflicts.clone()))
        .expect("Failed to register settlement_accrual_lock_conflicts_total");
    registry
        .register(Box::new(db_duration.clone()))
        .expect("Failed to register settlement_db_query_duration_seconds");

    let _ = PROMETHEUS_REGISTRY.set(registry);
    let _ = SETTLEMENT_OPERATIONS_TOTAL.set(operations);
    let _ = ACCRUAL_LOCK_CONFLICTS_TOTAL.set(lock_conflicts);
    let _ = DB_QUERY_DURATION.set(db_duration);
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

/// Record the outcome of a settlement operation (`ok` or an error code).
pub fn record_operation(organization_id: &str, operation: &str, outcome: &str) {
    if let Some(counter) = SETTLEMENT_OPERATIONS_TOTAL.get() {
        counter
            .with_label_values(&[organization_id, operation, outcome])
            .inc();
    }
}

/// Record a conditional write that lost to a concurrent writer.
pub fn record_lock_conflict(operation: &str) {
    if let Some(counter) = ACCRUAL_LOCK_CONFLICTS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Start a DB timer for `operation`; dropped or observed, it records.
pub fn db_timer(operation: &str) -> Option<prometheus::HistogramTimer> {
    DB_QUERY_DURATION
        .get()
        .map(|histogram| histogram.with_label_values(&[operation]).start_timer())
}
