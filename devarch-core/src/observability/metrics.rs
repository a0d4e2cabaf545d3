//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    describe_counter!("devarch_plans_generated_total", "Total number of plans generated");
    describe_counter!(
        "devarch_plan_diagnostics_total",
        "Diagnostics attached to generated plans (by code)"
    );
    describe_counter!("devarch_apply_total", "Apply attempts (by outcome)");
    describe_histogram!("devarch_apply_duration_seconds", "Wall time of an apply, lock wait included");
    describe_histogram!("devarch_lock_wait_seconds", "Time spent waiting for a stack lock");
    describe_counter!("devarch_db_errors_total", "Database errors (by operation)");
}

pub fn record_plan_generated(diagnostic_codes: impl IntoIterator<Item = &'static str>) {
    counter!("devarch_plans_generated_total").increment(1);
    for code in diagnostic_codes {
        counter!("devarch_plan_diagnostics_total", "code" => code).increment(1);
    }
}

pub fn record_apply(outcome: &'static str, elapsed: Duration) {
    counter!("devarch_apply_total", "outcome" => outcome).increment(1);
    histogram!("devarch_apply_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_lock_wait(elapsed: Duration) {
    histogram!("devarch_lock_wait_seconds").record(elapsed.as_secs_f64());
}

pub fn record_db_error(operation: &'static str) {
    counter!("devarch_db_errors_total", "operation" => operation).increment(1);
}
