//! Prometheus metrics for student-ledger-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec,
    HistogramVec, IntCounter, TextEncoder,
};

/// Ledger operation counter by operation and outcome.
pub static OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "student_ledger_operations_total",
        "Total number of ledger operations",
        &["operation", "status"]
    )
    .expect("Failed to register operations_total")
});

/// End-to-end operation duration by operation.
pub static OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "student_ledger_operation_duration_seconds",
        "Ledger operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register operation_duration")
});

/// Writes that lost a version race and were retried.
pub static CONCURRENCY_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "student_ledger_concurrency_retries_total",
        "Total number of optimistic concurrency retries",
        &["operation"]
    )
    .expect("Failed to register concurrency_retries_total")
});

/// Records found inconsistent. Any increase needs an operator.
pub static INVARIANT_VIOLATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "student_ledger_invariant_violations_total",
        "Total number of ledger invariant violations detected"
    )
    .expect("Failed to register invariant_violations_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "student_ledger_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "student_ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&OPERATIONS_TOTAL);
    Lazy::force(&OPERATION_DURATION);
    Lazy::force(&CONCURRENCY_RETRIES_TOTAL);
    Lazy::force(&INVARIANT_VIOLATIONS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

pub fn record_operation(operation: &str, status: &str) {
    OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_retry(operation: &str) {
    CONCURRENCY_RETRIES_TOTAL
        .with_label_values(&[operation])
        .inc();
}

pub fn record_invariant_violation() {
    INVARIANT_VIOLATIONS_TOTAL.inc();
}

pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
