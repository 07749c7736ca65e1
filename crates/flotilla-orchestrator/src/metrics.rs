//! Observability metrics for the orchestrator.
//!
//! Exposed via the `metrics` crate facade; install any compatible exporter
//! in the host process. Recorders are single-owner: each worker and the
//! broker own their own instance and flush per unit of work, so no recorder
//! is shared across concurrent tasks.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `flotilla_evals_enqueued_total` | Counter | - | Evaluations accepted by the broker |
//! | `flotilla_evals_delivered_total` | Counter | - | Deliveries to workers |
//! | `flotilla_evals_acked_total` | Counter | - | Successful acks |
//! | `flotilla_evals_nacked_total` | Counter | - | Explicit nacks |
//! | `flotilla_evals_expired_total` | Counter | - | Visibility-timeout redeliveries |
//! | `flotilla_evals_failed_total` | Counter | - | Delivery-budget exhaustions |
//! | `flotilla_broker_ready_depth` | Gauge | - | Evaluations visible to dequeue |
//! | `flotilla_broker_inflight_depth` | Gauge | - | Unacked deliveries |
//! | `flotilla_broker_delayed_depth` | Gauge | - | Deferred evaluations |
//! | `flotilla_eval_process_duration_seconds` | Histogram | `job_type`, `outcome` | Worker processing time |
//! | `flotilla_plans_applied_total` | Counter | `outcome` | Planner applications |

use std::time::Instant;

use metrics::{counter, gauge, histogram};

use flotilla_core::job::JobType;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Evaluations accepted by the broker.
    pub const EVALS_ENQUEUED_TOTAL: &str = "flotilla_evals_enqueued_total";
    /// Counter: Deliveries to workers.
    pub const EVALS_DELIVERED_TOTAL: &str = "flotilla_evals_delivered_total";
    /// Counter: Successful acks.
    pub const EVALS_ACKED_TOTAL: &str = "flotilla_evals_acked_total";
    /// Counter: Explicit nacks.
    pub const EVALS_NACKED_TOTAL: &str = "flotilla_evals_nacked_total";
    /// Counter: Visibility-timeout redeliveries.
    pub const EVALS_EXPIRED_TOTAL: &str = "flotilla_evals_expired_total";
    /// Counter: Delivery-budget exhaustions.
    pub const EVALS_FAILED_TOTAL: &str = "flotilla_evals_failed_total";
    /// Gauge: Evaluations visible to dequeue.
    pub const BROKER_READY_DEPTH: &str = "flotilla_broker_ready_depth";
    /// Gauge: Unacked deliveries.
    pub const BROKER_INFLIGHT_DEPTH: &str = "flotilla_broker_inflight_depth";
    /// Gauge: Deferred evaluations.
    pub const BROKER_DELAYED_DEPTH: &str = "flotilla_broker_delayed_depth";
    /// Histogram: Worker processing time per evaluation, in seconds.
    pub const EVAL_PROCESS_DURATION_SECONDS: &str = "flotilla_eval_process_duration_seconds";
    /// Counter: Planner applications by outcome.
    pub const PLANS_APPLIED_TOTAL: &str = "flotilla_plans_applied_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Job type (batch, service, daemon, ops).
    pub const JOB_TYPE: &str = "job_type";
    /// Outcome status (ack, nack, failed).
    pub const OUTCOME: &str = "outcome";
}

/// Broker-owned recorder for queue counters and depth gauges.
#[derive(Debug, Default)]
pub struct BrokerMetrics;

impl BrokerMetrics {
    /// Creates a recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records an accepted evaluation.
    pub fn enqueued(&self) {
        counter!(names::EVALS_ENQUEUED_TOTAL).increment(1);
    }

    /// Records a delivery.
    pub fn delivered(&self) {
        counter!(names::EVALS_DELIVERED_TOTAL).increment(1);
    }

    /// Records an ack.
    pub fn acked(&self) {
        counter!(names::EVALS_ACKED_TOTAL).increment(1);
    }

    /// Records a nack.
    pub fn nacked(&self) {
        counter!(names::EVALS_NACKED_TOTAL).increment(1);
    }

    /// Records a visibility-timeout expiry.
    pub fn expired(&self) {
        counter!(names::EVALS_EXPIRED_TOTAL).increment(1);
    }

    /// Records a delivery-budget exhaustion.
    pub fn failed(&self) {
        counter!(names::EVALS_FAILED_TOTAL).increment(1);
    }

    /// Publishes the current queue depths.
    #[allow(clippy::cast_precision_loss)]
    pub fn depths(&self, ready: usize, inflight: usize, delayed: usize) {
        gauge!(names::BROKER_READY_DEPTH).set(ready as f64);
        gauge!(names::BROKER_INFLIGHT_DEPTH).set(inflight as f64);
        gauge!(names::BROKER_DELAYED_DEPTH).set(delayed as f64);
    }
}

/// Per-evaluation recorder owned by a single worker iteration.
///
/// Created when an evaluation is dequeued and flushed exactly once with the
/// outcome; aggregates nothing across evaluations.
#[derive(Debug)]
pub struct EvalRecorder {
    job_type: JobType,
    started: Instant,
}

impl EvalRecorder {
    /// Starts timing an evaluation.
    #[must_use]
    pub fn start(job_type: JobType) -> Self {
        Self {
            job_type,
            started: Instant::now(),
        }
    }

    /// Flushes the processing duration with its outcome.
    pub fn flush(self, outcome: &'static str) {
        histogram!(
            names::EVAL_PROCESS_DURATION_SECONDS,
            labels::JOB_TYPE => self.job_type.to_string(),
            labels::OUTCOME => outcome,
        )
        .record(self.started.elapsed().as_secs_f64());
    }
}

/// Records a planner application outcome.
pub fn record_plan_applied(outcome: &'static str) {
    counter!(names::PLANS_APPLIED_TOTAL, labels::OUTCOME => outcome).increment(1);
}
