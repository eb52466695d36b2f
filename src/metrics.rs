// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tristore-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tristore_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: relational, visual, vector
//! - `operation`: write, read, delete, ping
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record one adapter call outcome (after retries)
pub fn record_operation(store: &str, operation: &str, status: &str) {
    counter!(
        "tristore_sync_operations_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record adapter call latency, retries included
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "tristore_sync_operation_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry scheduled after a transient failure
pub fn record_retry(store: &str, operation: &str, error_kind: &str) {
    counter!(
        "tristore_sync_retries_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "error" => error_kind.to_string()
    )
    .increment(1);
}

/// Record a timed-out adapter attempt
pub fn record_timeout(store: &str, operation: &str) {
    counter!(
        "tristore_sync_timeouts_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a coordinator write: `full`, `partial` or `failed`
pub fn record_write(outcome: &str, duration: Duration) {
    counter!("tristore_sync_writes_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("tristore_sync_write_seconds").record(duration.as_secs_f64());
}

/// Record a consistency check verdict
pub fn record_consistency_check(consistent: bool) {
    let verdict = if consistent { "consistent" } else { "divergent" };
    counter!("tristore_sync_consistency_checks_total", "verdict" => verdict).increment(1);
}

/// Record the largest observed timestamp skew for a record
pub fn record_skew(skew: Duration) {
    histogram!("tristore_sync_timestamp_skew_seconds").record(skew.as_secs_f64());
}

/// Record a reconciliation outcome (repaired, stale, deferred, manual_review, ...)
pub fn record_reconcile(outcome: &str) {
    counter!("tristore_sync_reconciliations_total", "outcome" => outcome.to_string()).increment(1);
}

/// Set the number of pending retry-queue entries
pub fn set_retry_queue_depth(count: usize) {
    gauge!("tristore_sync_retry_queue_depth").set(count as f64);
}

/// Set the number of records parked for manual review
pub fn set_manual_review_depth(count: usize) {
    gauge!("tristore_sync_manual_review_depth").set(count as f64);
}

/// Record a ledger failure (enqueue, flag, ...)
pub fn record_ledger_error(operation: &str) {
    counter!("tristore_sync_ledger_errors_total", "operation" => operation.to_string()).increment(1);
}

/// Record one scheduler pass
pub fn record_pass(duration: Duration, checked: usize, repaired: usize) {
    histogram!("tristore_sync_pass_seconds").record(duration.as_secs_f64());
    counter!("tristore_sync_pass_records_checked_total").increment(checked as u64);
    counter!("tristore_sync_pass_records_repaired_total").increment(repaired as u64);
}

/// Set store health (1 = healthy, 0 = unhealthy)
pub fn set_store_healthy(store: &str, healthy: bool) {
    gauge!(
        "tristore_sync_store_healthy",
        "store" => store.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Set engine state gauge (one-hot per state label)
pub fn set_engine_state(state: &str) {
    for candidate in ["Created", "Running", "ShuttingDown", "Stopped"] {
        gauge!("tristore_sync_engine_state", "state" => candidate)
            .set(if candidate == state { 1.0 } else { 0.0 });
    }
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    store: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(store: &'static str, operation: &'static str) -> Self {
        Self {
            store,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.store, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($store:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($store, $op)
    };
}
