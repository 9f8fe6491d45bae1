//! Metrics module for vault-service.
//! Prometheus metrics for grants, points aggregation and payment runs.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!("vault_db_query_duration_seconds", "Database query duration"),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Grant operations counter (authorizations, contracts, claims)
pub static GRANT_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment runs counter by final status
pub static PAYMENT_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Organizations processed in payment runs, by outcome
pub static ORGANIZATIONS_BILLED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Points billed, by currency
pub static POINTS_BILLED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Collaborator call duration
pub static COLLABORATOR_CALL_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    GRANT_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "vault_grant_operations_total",
                "Total grant operations by entity and operation type"
            ),
            &["entity", "operation"]
        )
        .expect("Failed to register GRANT_OPERATIONS_TOTAL")
    });

    PAYMENT_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("vault_payment_runs_total", "Total payment runs by status"),
            &["status"]
        )
        .expect("Failed to register PAYMENT_RUNS_TOTAL")
    });

    ORGANIZATIONS_BILLED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "vault_organizations_billed_total",
                "Organizations handled by payment runs, by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register ORGANIZATIONS_BILLED_TOTAL")
    });

    POINTS_BILLED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("vault_points_billed_total", "Total points billed by currency"),
            &["currency"]
        )
        .expect("Failed to register POINTS_BILLED_TOTAL")
    });

    COLLABORATOR_CALL_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "vault_collaborator_call_duration_seconds",
                "Directory, balance and invoice call duration",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["service", "operation"]
        )
        .expect("Failed to register COLLABORATOR_CALL_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("vault_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a grant operation.
pub fn record_grant_operation(entity: &str, operation: &str) {
    if let Some(counter) = GRANT_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[entity, operation]).inc();
    }
}

/// Record a finished payment run.
pub fn record_payment_run(status: &str) {
    if let Some(counter) = PAYMENT_RUNS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record one organization's outcome within a run.
pub fn record_organization_outcome(outcome: &str) {
    if let Some(counter) = ORGANIZATIONS_BILLED_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record points charged to an organization.
pub fn record_points_billed(currency: &str, points: i64) {
    if let Some(counter) = POINTS_BILLED_TOTAL.get() {
        counter
            .with_label_values(&[currency])
            .inc_by(points.max(0) as u64);
    }
}

/// Record a collaborator call duration.
pub fn record_collaborator_call(service: &str, operation: &str, duration_secs: f64) {
    if let Some(histogram) = COLLABORATOR_CALL_DURATION.get() {
        histogram
            .with_label_values(&[service, operation])
            .observe(duration_secs);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
