//! Executions and their state machines.
//!
//! An [`Execution`] is one attempt to place and run a job partition on a
//! specific node. Two writers share the record: the orchestrator owns
//! [`Execution::desired_state`], the owning compute node owns
//! [`Execution::compute_state`] and [`Execution::run_result`]. The store
//! reconciles them with compare-and-set preconditions (see
//! [`crate::store`]).
//!
//! ```text
//!  New ──► AskForBid ──► AskForBidAccepted ──► BidAccepted ──► Running
//!              │                  │                               │
//!              ▼                  ▼                   ┌───────────┼─────────┐
//!      AskForBidRejected     BidRejected              ▼           ▼         ▼
//!                                                Publishing   Completed   Failed
//!                                                     │
//!                                                     ▼
//!                                               Completed
//!
//!  any non-terminal ──► Cancelled   (desired state flipped to Stopped)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{EvalId, ExecutionId, JobId, NodeId};
use crate::job::Job;
use crate::resources::{AllocatedResources, Resources};
use crate::spec_config::SpecConfig;

/// State message a node sets when declining a bid because capacity is
/// committed right now, as opposed to a semantic refusal. Schedulers may ask
/// such a node again once capacity frees; semantic decliners are not
/// re-asked.
pub const REASON_CAPACITY_UNAVAILABLE: &str = "insufficient capacity";

/// The state of an execution as observed by its compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeState {
    /// Created by the planner, not yet seen by the compute node.
    New,
    /// The node acknowledged the placement and is deciding whether to bid.
    AskForBid,
    /// The node accepted the ask and reserved capacity.
    AskForBidAccepted,
    /// The node declined the ask. Terminal.
    AskForBidRejected,
    /// The orchestrator committed to the node's bid.
    BidAccepted,
    /// The task is running.
    Running,
    /// The task finished and its results are being published.
    Publishing,
    /// The execution finished and any results were published. Terminal.
    Completed,
    /// The execution failed. Terminal.
    Failed,
    /// The execution was stopped on request. Terminal.
    Cancelled,
    /// The orchestrator withdrew the bid. Terminal.
    BidRejected,
}

impl ComputeState {
    /// Returns true if no further compute-state transition is accepted.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::BidRejected
                | Self::AskForBidRejected
        )
    }

    /// Returns true if the task is committed or running on the node.
    #[must_use]
    pub const fn is_executing(&self) -> bool {
        matches!(self, Self::BidAccepted | Self::Running | Self::Publishing)
    }

    /// Returns true if the execution ended without completing: failed,
    /// cancelled or rejected at either bid stage.
    #[must_use]
    pub const fn is_discarded(&self) -> bool {
        matches!(
            self,
            Self::AskForBidRejected | Self::BidRejected | Self::Cancelled | Self::Failed
        )
    }

    /// Returns true if the execution is still in the bid handshake.
    #[must_use]
    pub const fn is_bidding(&self) -> bool {
        matches!(self, Self::New | Self::AskForBid | Self::AskForBidAccepted)
    }

    /// Returns true if the transition from `self` to `target` is legal.
    ///
    /// `Running -> Running` is legal so a node restart can re-enter the
    /// running phase idempotently. Any non-terminal state may move to
    /// `Cancelled` (a stop request) or `Failed` (an unrecoverable error).
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(target, Self::Cancelled | Self::Failed) {
            return true;
        }
        match self {
            Self::New => matches!(target, Self::AskForBid),
            Self::AskForBid => {
                matches!(target, Self::AskForBidAccepted | Self::AskForBidRejected)
            }
            Self::AskForBidAccepted => matches!(target, Self::BidAccepted | Self::BidRejected),
            Self::BidAccepted => matches!(target, Self::Running),
            Self::Running => matches!(target, Self::Running | Self::Publishing | Self::Completed),
            Self::Publishing => matches!(target, Self::Completed),
            _ => false,
        }
    }
}

impl std::fmt::Display for ComputeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::AskForBid => "ask_for_bid",
            Self::AskForBidAccepted => "ask_for_bid_accepted",
            Self::AskForBidRejected => "ask_for_bid_rejected",
            Self::BidAccepted => "bid_accepted",
            Self::Running => "running",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::BidRejected => "bid_rejected",
        };
        write!(f, "{s}")
    }
}

/// The state the orchestrator wants an execution in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// Created, not yet approved to run.
    Pending,
    /// Approved; the node should drive it to completion.
    Running,
    /// The node should stop it. Terminal.
    Stopped,
}

impl DesiredState {
    /// Returns true if the desired state is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A state value paired with an optional human-readable message.
///
/// The message records why the state was entered ("node disconnected",
/// "bid rejected: networking disabled") for the event history and API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State<T> {
    /// The state value.
    pub state: T,
    /// Why the state was entered, if noteworthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> State<T> {
    /// Creates a state with no message.
    pub const fn new(state: T) -> Self {
        Self {
            state,
            message: None,
        }
    }

    /// Attaches a message to the state.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The captured output of a task run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Captured stdout, truncated to the configured limit.
    pub stdout: String,
    /// True if stdout was truncated.
    pub stdout_truncated: bool,
    /// Captured stderr, truncated to the configured limit.
    pub stderr: String,
    /// True if stderr was truncated.
    pub stderr_truncated: bool,
    /// The task's exit code.
    pub exit_code: i32,
    /// Runner-level error, empty when the task itself ran.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl RunResult {
    /// Returns true if the task exited zero with no runner error.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.error_message.is_empty()
    }
}

/// One attempt to place and run a job partition on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// The execution's unique ID.
    pub id: ExecutionId,
    /// The job this execution places.
    pub job_id: JobId,
    /// The job version the execution was created under.
    pub job_version: u64,
    /// The namespace inherited from the job.
    pub namespace: String,
    /// The evaluation that generated this execution.
    pub eval_id: EvalId,
    /// The node the execution is placed on.
    pub node_id: NodeId,
    /// A read-only snapshot of the job, copied at scheduling time so later
    /// job replacements don't change what this execution runs.
    pub job: Job,
    /// Resources allocated to the execution's tasks.
    pub allocated_resources: AllocatedResources,
    /// Which of the job's `count` partitions this execution represents.
    pub partition_index: u32,
    /// The state the orchestrator wants. Orchestrator-owned.
    pub desired_state: State<DesiredState>,
    /// The state the compute node observed. Compute-owned.
    pub compute_state: State<ComputeState>,
    /// Artifact descriptor returned by the publisher, empty until published.
    #[serde(default)]
    pub published_result: SpecConfig,
    /// Captured run output. Compute-owned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_result: Option<RunResult>,
    /// The failed execution this one replaces, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_execution: Option<ExecutionId>,
    /// The replacement execution, set on the failed one when retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<ExecutionId>,
    /// A follow-up evaluation created to reschedule after failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup_eval_id: Option<EvalId>,
    /// Bumped by the store on every mutation.
    pub revision: u64,
    /// When the planner created the execution.
    pub create_time: DateTime<Utc>,
    /// When the store last mutated the execution.
    pub modify_time: DateTime<Utc>,
}

impl Execution {
    /// Creates a new execution for a job partition on a node.
    ///
    /// The execution starts in `ComputeState::New` / `DesiredState::Pending`
    /// with the task's resources allocated.
    #[must_use]
    pub fn new(job: &Job, node_id: NodeId, eval_id: EvalId, partition_index: u32) -> Self {
        let now = Utc::now();
        let task = job.task();
        Self {
            id: ExecutionId::generate(),
            job_id: job.id,
            job_version: job.version,
            namespace: job.namespace.clone(),
            eval_id,
            node_id,
            job: job.clone(),
            allocated_resources: AllocatedResources::for_task(task.name.clone(), task.resources),
            partition_index,
            desired_state: State::new(DesiredState::Pending),
            compute_state: State::new(ComputeState::New),
            published_result: SpecConfig::default(),
            run_result: None,
            previous_execution: None,
            next_execution: None,
            followup_eval_id: None,
            revision: 1,
            create_time: now,
            modify_time: now,
        }
    }

    /// Links this execution as the replacement of a failed one.
    #[must_use]
    pub const fn replacing(mut self, previous: ExecutionId) -> Self {
        self.previous_execution = Some(previous);
        self
    }

    /// Returns true if either the compute state or the desired state is
    /// terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.compute_state.state.is_terminal() || self.desired_state.state.is_terminal()
    }

    /// Componentwise total of the execution's allocated resources.
    #[must_use]
    pub fn total_allocated_resources(&self) -> Resources {
        self.allocated_resources.total()
    }

    /// Returns true if the execution is committed or running and has not
    /// been touched since `expiry`. Used to detect runs past their
    /// execution timeout.
    #[must_use]
    pub fn is_expired(&self, expiry: DateTime<Utc>) -> bool {
        self.compute_state.state.is_executing() && self.modify_time < expiry
    }

    /// Validates the execution record.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the namespace is blank, the partition
    /// index is out of range, or the embedded job snapshot is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::validation("execution must be in a namespace"));
        }
        self.job.validate()?;
        if self.partition_index >= self.job.count {
            return Err(Error::validation(format!(
                "partition index {} out of range for job count {}",
                self.partition_index, self.job.count
            )));
        }
        Ok(())
    }
}
