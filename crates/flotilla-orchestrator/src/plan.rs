//! Plans: the store mutations a scheduler proposes for one evaluation.
//!
//! A [`Plan`] is pure data; the scheduler that builds it never touches the
//! store, and the [`crate::planner::Planner`] that applies it never makes
//! placement decisions. Everything a scheduling pass wants to change rides
//! in one plan: executions to create, bids to approve, executions to stop,
//! link updates, follow-up evaluations and job events.

use flotilla_core::evaluation::Evaluation;
use flotilla_core::event::Event;
use flotilla_core::execution::{ComputeState, Execution};
use flotilla_core::id::{EvalId, ExecutionId, JobId};
use flotilla_core::store::UpdateExecutionRequest;

/// Approval of a compute node's bid: desired state moves to `Running`.
#[derive(Debug, Clone)]
pub struct ApproveExecution {
    /// The execution whose bid is approved.
    pub execution_id: ExecutionId,
    /// Compute states the approval is valid from; the update is dropped if
    /// the node moved on.
    pub expected_states: Vec<ComputeState>,
    /// Events appended with the approval.
    pub events: Vec<Event>,
}

/// A stop order: desired state moves to `Stopped`.
#[derive(Debug, Clone)]
pub struct StopExecution {
    /// The execution to stop.
    pub execution_id: ExecutionId,
    /// Why it is being stopped, recorded on the desired state.
    pub reason: String,
    /// Events appended with the stop.
    pub events: Vec<Event>,
}

/// The bundle of mutations proposed by a scheduler for a single evaluation.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The evaluation the plan answers.
    pub eval_id: EvalId,
    /// The job the evaluation is about.
    pub job_id: JobId,
    /// Executions to create, `New`/`Pending`, then sequenced to `Running`.
    pub new_executions: Vec<Execution>,
    /// Bids to approve.
    pub approved_executions: Vec<ApproveExecution>,
    /// Executions to stop; already-terminal ones are silently skipped.
    pub stopped_executions: Vec<StopExecution>,
    /// Field-level updates, e.g. retry linkage on a failed execution.
    pub updated_executions: Vec<UpdateExecutionRequest>,
    /// Follow-up evaluations, enqueued only after the store writes land.
    pub new_evaluations: Vec<Evaluation>,
    /// Events appended to the job's stream.
    pub job_events: Vec<Event>,
    /// Permanent scheduling failure to surface on the evaluation, if any.
    pub eval_failure: Option<String>,
}

impl Plan {
    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_executions.is_empty()
            && self.approved_executions.is_empty()
            && self.stopped_executions.is_empty()
            && self.updated_executions.is_empty()
            && self.new_evaluations.is_empty()
            && self.job_events.is_empty()
            && self.eval_failure.is_none()
    }
}

/// Builder for [`Plan`], in creation order.
#[derive(Debug)]
pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    /// Starts a plan answering `evaluation`.
    #[must_use]
    pub fn new(evaluation: &Evaluation) -> Self {
        Self {
            plan: Plan {
                eval_id: evaluation.id,
                job_id: evaluation.job_id,
                new_executions: Vec::new(),
                approved_executions: Vec::new(),
                stopped_executions: Vec::new(),
                updated_executions: Vec::new(),
                new_evaluations: Vec::new(),
                job_events: Vec::new(),
                eval_failure: None,
            },
        }
    }

    /// Adds an execution to create.
    pub fn create_execution(&mut self, execution: Execution) -> &mut Self {
        self.plan.new_executions.push(execution);
        self
    }

    /// Approves a bid from the given expected compute states.
    pub fn approve_execution(
        &mut self,
        execution_id: ExecutionId,
        expected_states: Vec<ComputeState>,
        events: Vec<Event>,
    ) -> &mut Self {
        self.plan.approved_executions.push(ApproveExecution {
            execution_id,
            expected_states,
            events,
        });
        self
    }

    /// Stops an execution.
    pub fn stop_execution(
        &mut self,
        execution_id: ExecutionId,
        reason: impl Into<String>,
        events: Vec<Event>,
    ) -> &mut Self {
        self.plan.stopped_executions.push(StopExecution {
            execution_id,
            reason: reason.into(),
            events,
        });
        self
    }

    /// Adds a field-level execution update.
    pub fn update_execution(&mut self, request: UpdateExecutionRequest) -> &mut Self {
        self.plan.updated_executions.push(request);
        self
    }

    /// Enqueues a follow-up evaluation after the store writes land.
    pub fn enqueue_evaluation(&mut self, evaluation: Evaluation) -> &mut Self {
        self.plan.new_evaluations.push(evaluation);
        self
    }

    /// Appends an event to the job's stream.
    pub fn job_event(&mut self, event: Event) -> &mut Self {
        self.plan.job_events.push(event);
        self
    }

    /// Surfaces a permanent scheduling failure on the evaluation.
    pub fn fail_evaluation(&mut self, reason: impl Into<String>) -> &mut Self {
        self.plan.eval_failure = Some(reason.into());
        self
    }

    /// Finishes the plan.
    #[must_use]
    pub fn build(self) -> Plan {
        self.plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::evaluation::trigger;
    use flotilla_core::job::JobType;

    #[test]
    fn builder_carries_eval_identity() {
        let eval = Evaluation::new(
            JobId::generate(),
            "default",
            JobType::Batch,
            trigger::JOB_REGISTER,
        );
        let plan = PlanBuilder::new(&eval).build();
        assert_eq!(plan.eval_id, eval.id);
        assert_eq!(plan.job_id, eval.job_id);
        assert!(plan.is_empty());
    }

    #[test]
    fn fail_evaluation_makes_plan_non_empty() {
        let eval = Evaluation::new(
            JobId::generate(),
            "default",
            JobType::Batch,
            trigger::JOB_REGISTER,
        );
        let mut builder = PlanBuilder::new(&eval);
        builder.fail_evaluation("no eligible nodes");
        let plan = builder.build();
        assert!(!plan.is_empty());
        assert_eq!(plan.eval_failure.as_deref(), Some("no eligible nodes"));
    }
}
