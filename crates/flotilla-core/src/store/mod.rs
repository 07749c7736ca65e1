//! The execution-store contract.
//!
//! The store is the transactional, versioned log of executions and their
//! events, shared by the orchestrator and every compute node. It is the only
//! coordination point between the two: the orchestrator writes desired
//! state, compute nodes write observed state, and neither can clobber the
//! other because every update carries compare-and-set preconditions.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Updates fail with
//!   [`crate::error::Error::ConditionFailed`] when the stored state does not
//!   match the caller's expectation, so non-commutative writes from the two
//!   owners cannot both land
//! - **Terminal fencing**: Once an execution's compute state is terminal, the
//!   store refuses further compute-state transitions with
//!   [`crate::error::Error::ExecutionAlreadyTerminal`]
//! - **Monotone revisions**: Every successful mutation bumps `revision` by
//!   exactly one and refreshes `modify_time`
//! - **Watchable**: Consumers follow a restartable change feed, keeping their
//!   own checkpoint; delivery is at-least-once with de-duplication by `seq`
//!
//! Persistence engines are pluggable; [`memory::InMemoryExecutionStore`]
//! implements the contract for tests and single-process deployments.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;
use crate::execution::{ComputeState, DesiredState, Execution, RunResult, State};
use crate::id::{EvalId, ExecutionId, JobId, NodeId};
use crate::spec_config::SpecConfig;

/// Preconditions an update must meet to be applied.
///
/// Empty vectors and `None` mean "no expectation" for that field.
#[derive(Debug, Clone, Default)]
pub struct UpdateCondition {
    /// The stored compute state must be one of these.
    pub expected_states: Vec<ComputeState>,
    /// The stored desired state must be one of these.
    pub expected_desired_states: Vec<DesiredState>,
    /// The stored revision must equal this.
    pub expected_revision: Option<u64>,
}

impl UpdateCondition {
    /// Requires the stored compute state to be one of `states`.
    #[must_use]
    pub fn expect_states(mut self, states: impl IntoIterator<Item = ComputeState>) -> Self {
        self.expected_states = states.into_iter().collect();
        self
    }

    /// Requires the stored desired state to be one of `states`.
    #[must_use]
    pub fn expect_desired_states(
        mut self,
        states: impl IntoIterator<Item = DesiredState>,
    ) -> Self {
        self.expected_desired_states = states.into_iter().collect();
        self
    }

    /// Requires the stored revision to equal `revision`.
    #[must_use]
    pub const fn expect_revision(mut self, revision: u64) -> Self {
        self.expected_revision = Some(revision);
        self
    }

    /// Returns true if the condition carries no expectations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expected_states.is_empty()
            && self.expected_desired_states.is_empty()
            && self.expected_revision.is_none()
    }
}

/// The fields an update may change.
///
/// `None` fields are left untouched. Each owner writes only its own fields;
/// the store does not police ownership, the preconditions do.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    /// New observed state. Compute-owned.
    pub compute_state: Option<State<ComputeState>>,
    /// New desired state. Orchestrator-owned.
    pub desired_state: Option<State<DesiredState>>,
    /// Captured run output. Compute-owned.
    pub run_result: Option<RunResult>,
    /// Published artifact descriptor. Compute-owned.
    pub published_result: Option<SpecConfig>,
    /// Link to the replacement execution. Orchestrator-owned.
    pub next_execution: Option<ExecutionId>,
    /// Follow-up evaluation handling this execution's failure.
    pub followup_eval_id: Option<EvalId>,
}

impl ExecutionUpdate {
    /// Sets the observed compute state.
    #[must_use]
    pub fn compute_state(mut self, state: State<ComputeState>) -> Self {
        self.compute_state = Some(state);
        self
    }

    /// Sets the desired state.
    #[must_use]
    pub fn desired_state(mut self, state: State<DesiredState>) -> Self {
        self.desired_state = Some(state);
        self
    }

    /// Sets the captured run output.
    #[must_use]
    pub fn run_result(mut self, result: RunResult) -> Self {
        self.run_result = Some(result);
        self
    }

    /// Sets the published artifact descriptor.
    #[must_use]
    pub fn published_result(mut self, result: SpecConfig) -> Self {
        self.published_result = Some(result);
        self
    }

    /// Links the replacement execution.
    #[must_use]
    pub const fn next_execution(mut self, id: ExecutionId) -> Self {
        self.next_execution = Some(id);
        self
    }

    /// Records the follow-up evaluation.
    #[must_use]
    pub const fn followup_eval(mut self, id: EvalId) -> Self {
        self.followup_eval_id = Some(id);
        self
    }
}

/// A conditional update of one execution, with events appended atomically.
#[derive(Debug, Clone)]
pub struct UpdateExecutionRequest {
    /// The execution to update.
    pub execution_id: ExecutionId,
    /// Preconditions; checked after the terminal fence.
    pub condition: UpdateCondition,
    /// The fields to change.
    pub new_values: ExecutionUpdate,
    /// Events appended to the execution's stream in the same transaction.
    pub events: Vec<Event>,
}

impl UpdateExecutionRequest {
    /// Creates an unconditional empty update of the given execution.
    #[must_use]
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            condition: UpdateCondition::default(),
            new_values: ExecutionUpdate::default(),
            events: Vec::new(),
        }
    }

    /// Sets the preconditions.
    #[must_use]
    pub fn condition(mut self, condition: UpdateCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Sets the fields to change.
    #[must_use]
    pub fn new_values(mut self, new_values: ExecutionUpdate) -> Self {
        self.new_values = new_values;
        self
    }

    /// Appends an event in the same transaction.
    #[must_use]
    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }
}

/// What happened to an execution in a change-feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The execution was created.
    Created,
    /// The execution was updated.
    Updated,
}

/// One entry in the store's change feed.
#[derive(Debug, Clone)]
pub struct ExecutionChange {
    /// Strictly increasing feed position; the consumer's checkpoint.
    pub seq: u64,
    /// What happened.
    pub kind: ChangeKind,
    /// The execution after the change.
    pub execution: Execution,
}

/// A restartable consumer of the store's change feed.
///
/// Watchers deliver at-least-once: after a crash, restart from the last
/// checkpointed `seq` and de-duplicate anything already processed.
#[async_trait]
pub trait ExecutionWatcher: Send {
    /// Returns the next change after the current checkpoint, waiting for one
    /// to arrive if the feed is drained.
    async fn next(&mut self) -> Result<ExecutionChange>;

    /// The `seq` of the last change returned; pass to
    /// [`ExecutionStore::watch`] to resume after a restart.
    fn checkpoint(&self) -> u64;
}

/// Filters for node-scoped execution queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeExecutionFilter {
    /// Every execution ever placed on the node.
    All,
    /// Only executions that are not yet terminal.
    #[default]
    NonTerminal,
}

/// The transactional, versioned log of executions and their events.
///
/// ## Guarantees
///
/// - Writes to a single execution are linearizable
/// - `revision` increases by exactly one per successful update
/// - `modify_time >= create_time` always
/// - Event `seq` is strictly increasing per stream
/// - The change feed delivers every change at least once, in `seq` order
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Creates a new execution.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::ExecutionAlreadyExists`] if the ID is
    /// taken, or a validation error if the record is malformed.
    async fn create_execution(&self, execution: Execution) -> Result<()>;

    /// Conditionally updates an execution, appending events atomically.
    ///
    /// Returns the execution after the update.
    ///
    /// # Errors
    ///
    /// - [`crate::error::Error::NotFound`] if the execution does not exist
    /// - [`crate::error::Error::ExecutionAlreadyTerminal`] if the stored
    ///   compute state is terminal and the update carries a compute-state
    ///   transition
    /// - [`crate::error::Error::ConditionFailed`] if any precondition does
    ///   not match
    async fn update_execution(&self, request: UpdateExecutionRequest) -> Result<Execution>;

    /// Gets an execution by ID.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::NotFound`] if it does not exist.
    async fn get_execution(&self, id: &ExecutionId) -> Result<Execution>;

    /// Gets all executions of a job, oldest first.
    async fn get_executions(&self, job_id: &JobId) -> Result<Vec<Execution>>;

    /// Gets the executions placed on a node, oldest first.
    async fn get_executions_by_node(
        &self,
        node_id: &NodeId,
        filter: NodeExecutionFilter,
    ) -> Result<Vec<Execution>>;

    /// Opens a change-feed watcher positioned after `from_seq`.
    ///
    /// Pass `0` to receive every retained change; pass a previously
    /// checkpointed `seq` to resume.
    async fn watch(&self, from_seq: u64) -> Result<Box<dyn ExecutionWatcher>>;

    /// Returns an execution's event stream, in append order.
    async fn execution_events(&self, id: &ExecutionId) -> Result<Vec<Event>>;

    /// Returns a job's event stream, in append order.
    async fn job_events(&self, job_id: &JobId) -> Result<Vec<Event>>;

    /// Appends events to a job's stream.
    async fn append_job_events(&self, job_id: JobId, events: Vec<Event>) -> Result<()>;
}
