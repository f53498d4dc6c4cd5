//! Metrics module for subscription-service.
//! Provides Prometheus metrics for lifecycle transitions, invoicing and
//! billing runs.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, TextEncoder, histogram_opts, opts,
    register_histogram_vec, register_int_counter_vec,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Phase transitions counter
pub static TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices created counter
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Plan changes counter
pub static PLAN_CHANGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing runs counter
pub static BILLING_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoiced amount counter by currency (monetary tracking)
pub static INVOICE_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_transitions_total",
                "Total phase transitions by kind and outcome"
            ),
            &["transition", "status"]
        )
        .expect("Failed to register TRANSITIONS_TOTAL")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_invoices_created_total",
                "Total invoices created by type"
            ),
            &["invoice_type"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    PLAN_CHANGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_plan_changes_total",
                "Total plan changes by direction and stage"
            ),
            &["change_type", "stage"]
        )
        .expect("Failed to register PLAN_CHANGES_TOTAL")
    });

    BILLING_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_billing_runs_total",
                "Total billing runs by type and status"
            ),
            &["run_type", "status"]
        )
        .expect("Failed to register BILLING_RUNS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "subscription_invoice_amount_total",
                "Total invoiced amount by currency and type"
            ),
            &["currency", "invoice_type"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a phase transition attempt and its outcome.
pub fn record_transition(transition: &str, status: &str) {
    if let Some(counter) = TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[transition, status]).inc();
    }
}

/// Record a created invoice.
pub fn record_invoice_created(invoice_type: &str) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[invoice_type]).inc();
    }
}

/// Record a plan change reaching a stage (proposed, applied, canceled).
pub fn record_plan_change(change_type: &str, stage: &str) {
    if let Some(counter) = PLAN_CHANGES_TOTAL.get() {
        counter.with_label_values(&[change_type, stage]).inc();
    }
}

/// Record a billing run.
pub fn record_billing_run(run_type: &str, status: &str) {
    if let Some(counter) = BILLING_RUNS_TOTAL.get() {
        counter.with_label_values(&[run_type, status]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}

/// Record an invoiced amount for financial tracking.
pub fn record_invoice_amount(currency: &str, invoice_type: &str, amount: f64) {
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[currency, invoice_type])
            .inc_by(amount.abs());
    }
}
