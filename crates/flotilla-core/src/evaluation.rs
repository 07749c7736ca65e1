//! Evaluations: the triggers that ask a scheduler to reconcile a job.
//!
//! An [`Evaluation`] is the unit of work the orchestrator's workers process.
//! Anything that may change a job's placement — submission, a node joining
//! or draining, an execution failing, a periodic sweep — enqueues one.
//! Receipt handles are a broker concern and never live on the record; the
//! broker rotates them per delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{EvalId, JobId};
use crate::job::JobType;

/// Well-known values for [`Evaluation::triggered_by`].
pub mod trigger {
    /// A job was registered or replaced.
    pub const JOB_REGISTER: &str = "job-register";
    /// A node joined the cluster.
    pub const NODE_JOIN: &str = "node-join";
    /// A node is draining.
    pub const NODE_DRAIN: &str = "node-drain";
    /// An execution failed or was rejected.
    pub const EXECUTION_FAILED: &str = "execution-failed";
    /// A periodic or deferred re-check.
    pub const PERIODIC: &str = "periodic";
}

/// The processing status of an evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    /// Waiting in the broker or being processed.
    #[default]
    Pending,
    /// A worker processed it and applied its plan.
    Complete,
    /// Processing gave up permanently.
    Failed,
    /// The evaluation was withdrawn.
    Cancelled,
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A scheduling trigger for a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// The evaluation's unique ID.
    pub id: EvalId,
    /// The job to reconcile.
    pub job_id: JobId,
    /// The namespace inherited from the job.
    pub namespace: String,
    /// The job's type, used by the broker to route to capable schedulers.
    pub job_type: JobType,
    /// Scheduling priority inherited from the job; higher dequeues first.
    pub priority: i64,
    /// What caused this evaluation; one of the [`trigger`] constants.
    pub triggered_by: String,
    /// Do not deliver before this time, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    /// Processing status.
    #[serde(default)]
    pub status: EvalStatus,
    /// Why the status was entered, if noteworthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_description: Option<String>,
    /// When the evaluation was created.
    pub create_time: DateTime<Utc>,
}

impl Evaluation {
    /// Creates a pending evaluation for a job.
    #[must_use]
    pub fn new(
        job_id: JobId,
        namespace: impl Into<String>,
        job_type: JobType,
        triggered_by: &str,
    ) -> Self {
        Self {
            id: EvalId::generate(),
            job_id,
            namespace: namespace.into(),
            job_type,
            priority: 0,
            triggered_by: triggered_by.to_string(),
            wait_until: None,
            status: EvalStatus::Pending,
            status_description: None,
            create_time: Utc::now(),
        }
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Defers delivery until the given time.
    #[must_use]
    pub const fn with_wait_until(mut self, wait_until: DateTime<Utc>) -> Self {
        self.wait_until = Some(wait_until);
        self
    }

    /// Returns true if the evaluation reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }
}
