//! Applies plans to the execution store and the broker.
//!
//! Ordering is the whole point of this module:
//!
//! 1. Creations land first, each sequenced `Pending -> Running` so the
//!    compute node sees an approved execution
//! 2. Bid approvals and stops are conditional updates; a stop that loses a
//!    race with a terminal transition is silently skipped
//! 3. Follow-up evaluations hit the broker only **after** every store write,
//!    so no consumer dequeues an evaluation whose job state has not landed
//! 4. Job events are appended last
//!
//! Per-item failures do not abort the pass; they are collected into one
//! aggregate error so the worker nacks the evaluation and the next delivery
//! reconciles whatever did land.

use std::sync::Arc;

use flotilla_core::error::{Error, Result};
use flotilla_core::event::{topics, Event};
use flotilla_core::execution::{ComputeState, DesiredState, State};
use flotilla_core::store::{
    ExecutionStore, ExecutionUpdate, UpdateCondition, UpdateExecutionRequest,
};

use crate::broker::EvaluationBroker;
use crate::metrics::record_plan_applied;
use crate::plan::Plan;
use crate::state::EvaluationSet;

/// All compute states a stop order may land on.
const STOPPABLE_STATES: [ComputeState; 6] = [
    ComputeState::New,
    ComputeState::AskForBid,
    ComputeState::AskForBidAccepted,
    ComputeState::BidAccepted,
    ComputeState::Running,
    ComputeState::Publishing,
];

/// Applies [`Plan`]s atomically where possible, field-by-field otherwise.
pub struct Planner {
    store: Arc<dyn ExecutionStore>,
    broker: EvaluationBroker,
    evaluations: Arc<EvaluationSet>,
}

impl Planner {
    /// Creates a planner over the store, broker and evaluation set.
    #[must_use]
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        broker: EvaluationBroker,
        evaluations: Arc<EvaluationSet>,
    ) -> Self {
        Self {
            store,
            broker,
            evaluations,
        }
    }

    /// Applies a plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlanApply`] aggregating every per-item failure;
    /// items that did apply stay applied.
    pub async fn process(&self, plan: &Plan) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();
        let total = plan.new_executions.len()
            + plan.approved_executions.len()
            + plan.stopped_executions.len()
            + plan.updated_executions.len()
            + plan.new_evaluations.len();

        for execution in &plan.new_executions {
            let id = execution.id;
            let created = self.store.create_execution(execution.clone()).await;
            match created {
                Err(error) => failures.push(format!("create {id}: {error}")),
                Ok(()) => {
                    // Approval is sequenced after creation so the record is
                    // never born running.
                    let approve = UpdateExecutionRequest::new(id)
                        .condition(
                            UpdateCondition::default()
                                .expect_desired_states([DesiredState::Pending]),
                        )
                        .new_values(
                            ExecutionUpdate::default()
                                .desired_state(State::new(DesiredState::Running)),
                        )
                        .with_event(Event::new(topics::EXEC_CREATED).with_message(format!(
                            "requested run on node {}",
                            execution.node_id
                        )));
                    if let Err(error) = self.store.update_execution(approve).await {
                        failures.push(format!("approve new {id}: {error}"));
                    }
                }
            }
        }

        for approval in &plan.approved_executions {
            let request = UpdateExecutionRequest {
                execution_id: approval.execution_id,
                condition: UpdateCondition::default()
                    .expect_states(approval.expected_states.iter().copied()),
                new_values: ExecutionUpdate::default()
                    .desired_state(State::new(DesiredState::Running)),
                events: approval.events.clone(),
            };
            match self.store.update_execution(request).await {
                Ok(_) => {}
                // The node moved past the expected state; the next
                // evaluation reconciles.
                Err(Error::ConditionFailed { .. } | Error::ExecutionAlreadyTerminal { .. }) => {}
                Err(error) => {
                    failures.push(format!("approve {}: {error}", approval.execution_id));
                }
            }
        }

        for stop in &plan.stopped_executions {
            let request = UpdateExecutionRequest {
                execution_id: stop.execution_id,
                condition: UpdateCondition::default().expect_states(STOPPABLE_STATES),
                new_values: ExecutionUpdate::default().desired_state(
                    State::new(DesiredState::Stopped).with_message(stop.reason.clone()),
                ),
                events: stop.events.clone(),
            };
            match self.store.update_execution(request).await {
                Ok(_) => {}
                // Already terminal: the stop is moot.
                Err(Error::ExecutionAlreadyTerminal { .. } | Error::ConditionFailed { .. }) => {}
                Err(error) => failures.push(format!("stop {}: {error}", stop.execution_id)),
            }
        }

        for update in &plan.updated_executions {
            if let Err(error) = self.store.update_execution(update.clone()).await {
                failures.push(format!("update {}: {error}", update.execution_id));
            }
        }

        // Store-before-broker: consumers must never see an evaluation whose
        // job updates have not landed.
        for evaluation in &plan.new_evaluations {
            let recorded = self
                .evaluations
                .insert(evaluation.clone())
                .and_then(|()| self.broker.enqueue(evaluation.clone()));
            if let Err(error) = recorded {
                failures.push(format!("enqueue evaluation {}: {error}", evaluation.id));
            }
        }

        if !plan.job_events.is_empty() {
            if let Err(error) = self
                .store
                .append_job_events(plan.job_id, plan.job_events.clone())
                .await
            {
                failures.push(format!("job events: {error}"));
            }
        }

        if failures.is_empty() {
            record_plan_applied("success");
            Ok(())
        } else {
            record_plan_applied("failure");
            tracing::warn!(
                eval_id = %plan.eval_id,
                job_id = %plan.job_id,
                failed = failures.len(),
                "plan applied with failures"
            );
            Err(Error::PlanApply {
                failed: failures.len(),
                total,
                messages: failures,
            })
        }
    }
}
