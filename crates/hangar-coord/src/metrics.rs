//! Coordination metrics.
//!
//! Recorded through the `metrics` facade; the embedding process installs an
//! exporter.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `hangar_claims_total` | Counter | `resource_type`, `result` |
//! | `hangar_dispatches_total` | Counter | `resource_type`, `operation`, `result` |
//! | `hangar_dispatch_duration_seconds` | Histogram | `resource_type`, `operation` |
//! | `hangar_lock_acquisitions_total` | Counter | `result` |
//! | `hangar_unlock_attempts_total` | Counter | `result` |
//! | `hangar_active_pollers` | Gauge | - |
//! | `hangar_poller_resolutions_total` | Counter | `reason` |
//! | `hangar_watch_reconnects_total` | Counter | `resource_type`, `reason` |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: claim attempts by outcome.
    pub const CLAIMS_TOTAL: &str = "hangar_claims_total";
    /// Counter: handler dispatches by operation and outcome.
    pub const DISPATCHES_TOTAL: &str = "hangar_dispatches_total";
    /// Histogram: handler dispatch duration in seconds.
    pub const DISPATCH_DURATION_SECONDS: &str = "hangar_dispatch_duration_seconds";
    /// Counter: `lock()` calls by outcome.
    pub const LOCK_ACQUISITIONS_TOTAL: &str = "hangar_lock_acquisitions_total";
    /// Counter: `unlock()` store attempts by outcome.
    pub const UNLOCK_ATTEMPTS_TOTAL: &str = "hangar_unlock_attempts_total";
    /// Gauge: live unlock poll tasks in this process.
    pub const ACTIVE_POLLERS: &str = "hangar_active_pollers";
    /// Counter: poll tasks resolved, by reason.
    pub const POLLER_RESOLUTIONS_TOTAL: &str = "hangar_poller_resolutions_total";
    /// Counter: watch re-registrations.
    pub const WATCH_RECONNECTS_TOTAL: &str = "hangar_watch_reconnects_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Watched resource type.
    pub const RESOURCE_TYPE: &str = "resource_type";
    /// Dispatched operation (create, update, delete, abort).
    pub const OPERATION: &str = "operation";
    /// Outcome of the attempt.
    pub const RESULT: &str = "result";
    /// Why something happened.
    pub const REASON: &str = "reason";
}

/// Recorder for coordination metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CoordMetrics;

impl CoordMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records the outcome of a claim attempt.
    pub fn record_claim(&self, resource_type: &str, result: &'static str) {
        counter!(
            names::CLAIMS_TOTAL,
            labels::RESOURCE_TYPE => resource_type.to_string(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a finished handler dispatch.
    pub fn record_dispatch(
        &self,
        resource_type: &str,
        operation: &'static str,
        result: &'static str,
        elapsed: Duration,
    ) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::RESOURCE_TYPE => resource_type.to_string(),
            labels::OPERATION => operation,
            labels::RESULT => result,
        )
        .increment(1);
        histogram!(
            names::DISPATCH_DURATION_SECONDS,
            labels::RESOURCE_TYPE => resource_type.to_string(),
            labels::OPERATION => operation,
        )
        .record(elapsed.as_secs_f64());
    }

    /// Records the outcome of a `lock()` call.
    pub fn record_lock(&self, result: &'static str) {
        counter!(names::LOCK_ACQUISITIONS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records one `unlock()` store attempt.
    pub fn record_unlock_attempt(&self, result: &'static str) {
        counter!(names::UNLOCK_ATTEMPTS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Sets the number of live poll tasks.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_active_pollers(&self, count: usize) {
        gauge!(names::ACTIVE_POLLERS).set(count as f64);
    }

    /// Records a resolved poll task.
    pub fn record_poller_resolution(&self, reason: &'static str) {
        counter!(names::POLLER_RESOLUTIONS_TOTAL, labels::REASON => reason).increment(1);
    }

    /// Records a watch re-registration.
    pub fn record_watch_reconnect(&self, resource_type: &str, reason: &'static str) {
        counter!(
            names::WATCH_RECONNECTS_TOTAL,
            labels::RESOURCE_TYPE => resource_type.to_string(),
            labels::REASON => reason,
        )
        .increment(1);
    }
}
