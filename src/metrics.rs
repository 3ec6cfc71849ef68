//! OpenTelemetry metrics for the endpoint copier
//!
//! Instruments are created lazily on the global meter. When no exporter is
//! installed they are no-ops, so recording is always safe.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::controller::Outcome;

/// Global meter for operator metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("endpoint-copier-operator"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Counter of reconciliations
///
/// Labels:
/// - `trigger`: endpoints, service
/// - `outcome`: synced, unchanged, source_missing, managed_missing, cleaned_up, released, error
pub static RECONCILIATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("endpoint_copier_reconciliations_total")
        .with_description("Total number of reconciliations by outcome")
        .with_unit("{reconciliations}")
        .build()
});

/// Histogram of reconciliation duration
///
/// Labels:
/// - `trigger`: endpoints, service
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("endpoint_copier_reconcile_duration_seconds")
        .with_description("Duration of reconciliation in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Slice Metrics
// ============================================================================

/// Counter of managed slices written
pub static SLICES_APPLIED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("endpoint_copier_slices_applied_total")
        .with_description("Total number of managed EndpointSlices applied")
        .with_unit("{slices}")
        .build()
});

/// Counter of managed slices deleted by pruning or garbage collection
pub static SLICES_DELETED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("endpoint_copier_slices_deleted_total")
        .with_description("Total number of managed EndpointSlices deleted")
        .with_unit("{slices}")
        .build()
});

/// Counter of single-item failures inside a batch
///
/// Labels:
/// - `operation`: apply, delete
pub static ITEM_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("endpoint_copier_item_failures_total")
        .with_description("Total number of per-slice failures that did not abort a batch")
        .with_unit("{failures}")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one reconciliation and records its outcome
pub struct ReconcileTimer {
    trigger: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation triggered by `trigger`
    pub fn start(trigger: &'static str) -> Self {
        Self {
            trigger,
            start: std::time::Instant::now(),
        }
    }

    /// Record a completed reconciliation
    pub fn finish(self, outcome: Outcome) {
        self.record(outcome.as_str());
    }

    /// Record a failed reconciliation
    pub fn error(self) {
        self.record("error");
    }

    fn record(self, outcome: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("trigger", self.trigger)],
        );
        RECONCILIATIONS.add(
            1,
            &[
                KeyValue::new("trigger", self.trigger),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

/// Record managed slices applied in one cycle
pub fn record_slices_applied(count: u64) {
    if count > 0 {
        SLICES_APPLIED.add(count, &[]);
    }
}

/// Record managed slices deleted in one cycle
pub fn record_slices_deleted(count: u64) {
    if count > 0 {
        SLICES_DELETED.add(count, &[]);
    }
}

/// Record one failed item in a batch
pub fn record_item_failure(operation: &'static str) {
    ITEM_FAILURES.add(1, &[KeyValue::new("operation", operation)]);
}
