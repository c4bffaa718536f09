//! Process-level Prometheus metrics.
//!
//! These complement the day-bucketed KVS counters with per-process telemetry
//! for dashboards: submissions admitted, executions by outcome, retries
//! scheduled, and execution latency.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_histogram, Counter, Encoder, Histogram, TextEncoder,
};
use tracing::error;

lazy_static! {
    /// Tasks admitted by the submission API.
    static ref TASKS_SUBMITTED: Counter = register_counter!(
        "taskwheel_tasks_submitted_total",
        "Total number of tasks admitted"
    ).expect("Can't create tasks_submitted metric");

    /// Attempts executed by this worker, successful outcome.
    static ref EXECUTIONS_SUCCEEDED: Counter = register_counter!(
        "taskwheel_executions_succeeded_total",
        "Total number of attempts that succeeded"
    ).expect("Can't create executions_succeeded metric");

    /// Attempts executed by this worker, failed outcome.
    static ref EXECUTIONS_FAILED: Counter = register_counter!(
        "taskwheel_executions_failed_total",
        "Total number of attempts that failed"
    ).expect("Can't create executions_failed metric");

    /// Retries placed on the timer wheel by fail recovery.
    static ref RETRIES_SCHEDULED: Counter = register_counter!(
        "taskwheel_retries_scheduled_total",
        "Total number of retries scheduled"
    ).expect("Can't create retries_scheduled metric");

    /// Tasks whose back-off schedule was exhausted.
    static ref PERMANENT_FAILURES: Counter = register_counter!(
        "taskwheel_permanent_failures_total",
        "Total number of permanently failed tasks"
    ).expect("Can't create permanent_failures metric");

    /// Wall-clock duration of task execution.
    static ref EXECUTION_DURATION_SECONDS: Histogram = register_histogram!(
        "taskwheel_execution_duration_seconds",
        "Duration of task execution in seconds"
    ).expect("Can't create execution_duration_seconds metric");
}

/// Record an admitted submission.
pub fn record_submission() {
    TASKS_SUBMITTED.inc();
}

/// Record one executed attempt.
pub fn record_execution(success: bool, duration_seconds: f64) {
    if success {
        EXECUTIONS_SUCCEEDED.inc();
    } else {
        EXECUTIONS_FAILED.inc();
    }
    EXECUTION_DURATION_SECONDS.observe(duration_seconds);
}

/// Record a retry placed on the wheel.
pub fn record_retry_scheduled() {
    RETRIES_SCHEDULED.inc();
}

/// Record an exhausted back-off schedule.
pub fn record_permanent_failure() {
    PERMANENT_FAILURES.inc();
}

/// Render the process registry in Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_registered_metrics() {
        record_submission();
        record_execution(true, 0.05);
        record_execution(false, 1.5);
        record_retry_scheduled();
        record_permanent_failure();

        let text = render();
        assert!(text.contains("taskwheel_tasks_submitted_total"));
        assert!(text.contains("taskwheel_executions_failed_total"));
        assert!(text.contains("taskwheel_execution_duration_seconds"));
    }
}
