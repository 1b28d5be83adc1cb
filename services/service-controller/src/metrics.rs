//! Controller metrics.
//!
//! Recorded through the `metrics` crate facade; the binary decides which
//! exporter (if any) is installed. Without a recorder every call is a no-op.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `rollouts_service_reconcile_total` | Counter | `outcome` | Processed service keys |
//! | `rollouts_service_reconcile_duration_seconds` | Histogram | `outcome` | Time spent per key |
//! | `rollouts_service_patches_total` | Counter | `patch` | Corrective patches applied |
//! | `rollouts_workqueue_depth` | Gauge | `queue` | Keys waiting in a queue |

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rollouts_reconcile::{Outcome, WorkerObserver};

use crate::model::ObjectKey;
use crate::patch::JsonPatch;

/// Metric names.
pub mod names {
    /// Counter: processed service keys by outcome.
    pub const RECONCILE_TOTAL: &str = "rollouts_service_reconcile_total";
    /// Histogram: per-key reconciliation time in seconds.
    pub const RECONCILE_DURATION_SECONDS: &str = "rollouts_service_reconcile_duration_seconds";
    /// Counter: corrective patches applied, by patch shape.
    pub const PATCHES_TOTAL: &str = "rollouts_service_patches_total";
    /// Gauge: keys waiting in a work queue.
    pub const WORKQUEUE_DEPTH: &str = "rollouts_workqueue_depth";
}

/// Label keys.
pub mod labels {
    /// Worker outcome (success, requeued, dropped).
    pub const OUTCOME: &str = "outcome";
    /// Patch shape (selector, selector_and_managed_by).
    pub const PATCH: &str = "patch";
    /// Queue name.
    pub const QUEUE: &str = "queue";
}

/// Records controller metrics. Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ControllerMetrics;

impl ControllerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Count a patch the store accepted.
    pub fn record_patch(&self, patch: &JsonPatch) {
        counter!(names::PATCHES_TOTAL, labels::PATCH => patch.label()).increment(1);
    }

    pub fn record_reconcile(&self, outcome: Outcome, duration: Duration) {
        counter!(names::RECONCILE_TOTAL, labels::OUTCOME => outcome.as_str()).increment(1);
        histogram!(names::RECONCILE_DURATION_SECONDS, labels::OUTCOME => outcome.as_str())
            .record(duration.as_secs_f64());
    }

    #[allow(clippy::cast_precision_loss)] // queue depths are small
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(names::WORKQUEUE_DEPTH, labels::QUEUE => queue.to_string()).set(depth as f64);
    }
}

impl WorkerObserver<ObjectKey> for ControllerMetrics {
    fn observe(&self, _key: &ObjectKey, duration: Duration, outcome: Outcome) {
        self.record_reconcile(outcome, duration);
    }

    fn queue_depth(&self, queue: &str, depth: usize) {
        self.set_queue_depth(queue, depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectMeta, ObjectRef, Service};
    use crate::patch::generate_remove_patch;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = ControllerMetrics::new();
        let key = ObjectKey::service(ObjectRef::new("team", "web"));

        metrics.observe(&key, Duration::from_millis(3), Outcome::Success);
        metrics.observe(&key, Duration::from_millis(3), Outcome::Requeued);
        metrics.queue_depth("services", 4);

        let svc = Service {
            metadata: ObjectMeta {
                namespace: "team".to_string(),
                name: "web".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        metrics.record_patch(&generate_remove_patch(&svc));
    }
}
