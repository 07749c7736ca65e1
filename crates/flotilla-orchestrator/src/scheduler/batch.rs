//! Batch and service scheduling policy.
//!
//! Per partition: keep exactly one execution making progress, absorb bid
//! rejections with over-asked placements, retry failures through the
//! [`RetryStrategy`], stop runs past their execution timeout, and defer
//! unplaceable partitions with a delayed follow-up evaluation instead of
//! failing a job the fleet may yet be able to run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use flotilla_core::error::Result;
use flotilla_core::evaluation::{trigger, Evaluation};
use flotilla_core::event::{topics, Event};
use flotilla_core::execution::{ComputeState, Execution, REASON_CAPACITY_UNAVAILABLE};
use flotilla_core::id::{ExecutionId, NodeId};
use flotilla_core::store::{ExecutionUpdate, UpdateExecutionRequest};

use crate::plan::{Plan, PlanBuilder};
use crate::retry::{RetryRequest, RetryStrategy};
use crate::scheduler::{Scheduler, World};

/// Scheduler for `Batch` and `Service` jobs.
pub struct BatchServiceScheduler {
    retry: Arc<dyn RetryStrategy>,
    over_ask_for_bids_factor: u32,
    queue_backoff: Duration,
}

impl BatchServiceScheduler {
    /// Creates the scheduler.
    ///
    /// `over_ask_for_bids_factor` placements are created per needed
    /// partition (at least one); `queue_backoff` is the delay before an
    /// unplaceable partition re-checks the fleet.
    #[must_use]
    pub fn new(
        retry: Arc<dyn RetryStrategy>,
        over_ask_for_bids_factor: u32,
        queue_backoff: Duration,
    ) -> Self {
        Self {
            retry,
            over_ask_for_bids_factor: over_ask_for_bids_factor.max(1),
            queue_backoff,
        }
    }
}

impl Scheduler for BatchServiceScheduler {
    #[allow(clippy::too_many_lines)]
    fn process(&self, evaluation: &Evaluation, world: &World) -> Result<Plan> {
        let job = &world.job;
        let mut builder = PlanBuilder::new(evaluation);
        let mut stopped: HashSet<ExecutionId> = HashSet::new();

        // Executions on lost nodes are stopped; their partitions fall
        // through to re-placement below.
        for execution in world.executions.iter().filter(|e| !e.is_terminal()) {
            if !world.healthy_nodes.contains(&execution.node_id) {
                builder.stop_execution(
                    execution.id,
                    "node lost",
                    vec![Event::new(topics::EXEC_NODE_LOST).with_message(format!(
                        "node {} is no longer available",
                        execution.node_id
                    ))],
                );
                stopped.insert(execution.id);
            }
        }

        // Runs past the task's execution timeout are stopped.
        let expiry = chrono::Duration::from_std(job.task().timeouts.execution)
            .ok()
            .and_then(|timeout| world.now.checked_sub_signed(timeout));
        if let Some(expiry) = expiry {
            let expired_ids: Vec<ExecutionId> = world
                .executions
                .iter()
                .filter(|e| !e.is_terminal() && !stopped.contains(&e.id))
                .filter(|e| e.is_expired(expiry))
                .map(|e| e.id)
                .collect();
            for execution_id in expired_ids {
                builder.stop_execution(
                    execution_id,
                    "execution timed out",
                    vec![Event::new(topics::EXEC_TIMED_OUT).with_message(format!(
                        "exceeded execution timeout of {:?}",
                        job.task().timeouts.execution
                    ))],
                );
                stopped.insert(execution_id);
            }
        }

        // Nodes already carrying a live partition of this job are off-limits
        // for further partitions; placements below extend this set.
        let mut used_nodes: HashSet<NodeId> = world
            .executions
            .iter()
            .filter(|e| !e.is_terminal() && !stopped.contains(&e.id))
            .map(|e| e.node_id.clone())
            .collect();

        let mut queued_partitions: Vec<Option<ExecutionId>> = Vec::new();
        let mut failure: Option<String> = None;

        for partition in 0..job.count {
            let executions: Vec<&Execution> = world
                .executions
                .iter()
                .filter(|e| e.partition_index == partition)
                .collect();
            let active: Vec<&Execution> = executions
                .iter()
                .copied()
                .filter(|e| !e.is_terminal() && !stopped.contains(&e.id))
                .collect();

            // A completed execution fulfils the partition for batch jobs.
            if job.job_type.completion_is_terminal()
                && executions
                    .iter()
                    .any(|e| e.compute_state.state == ComputeState::Completed)
            {
                for execution in &active {
                    builder.stop_execution(execution.id, "partition already completed", vec![]);
                    stopped.insert(execution.id);
                }
                continue;
            }

            // One execution running: keep the oldest, trim the rest.
            let mut executing: Vec<&Execution> = active
                .iter()
                .copied()
                .filter(|e| e.compute_state.state.is_executing())
                .collect();
            if !executing.is_empty() {
                executing.sort_by_key(|e| e.id);
                for surplus in executing.iter().skip(1) {
                    builder.stop_execution(surplus.id, "surplus execution", vec![]);
                    stopped.insert(surplus.id);
                }
                for bidder in active
                    .iter()
                    .filter(|e| e.compute_state.state.is_bidding())
                {
                    builder.stop_execution(
                        bidder.id,
                        "partition satisfied",
                        vec![Event::new(topics::EXEC_BID_REJECTED)],
                    );
                    stopped.insert(bidder.id);
                }
                continue;
            }

            // Accepted bids: approve the oldest, reject the surplus.
            let mut accepted: Vec<&Execution> = active
                .iter()
                .copied()
                .filter(|e| e.compute_state.state == ComputeState::AskForBidAccepted)
                .collect();
            if !accepted.is_empty() {
                accepted.sort_by_key(|e| e.id);
                builder.approve_execution(
                    accepted[0].id,
                    vec![ComputeState::AskForBidAccepted],
                    vec![Event::new(topics::EXEC_BID_ACCEPTED)],
                );
                for surplus in accepted.iter().skip(1) {
                    builder.stop_execution(
                        surplus.id,
                        "bid rejected: partition satisfied",
                        vec![Event::new(topics::EXEC_BID_REJECTED)],
                    );
                    stopped.insert(surplus.id);
                }
                continue;
            }

            // Bids still out: wait for the nodes to answer.
            if active.iter().any(|e| e.compute_state.state.is_bidding()) {
                continue;
            }

            // Unfulfilled. Count failed attempts before re-placing.
            let failed: Vec<&Execution> = executions
                .iter()
                .copied()
                .filter(|e| e.compute_state.state == ComputeState::Failed)
                .collect();
            let attempts = u32::try_from(failed.len()).unwrap_or(u32::MAX);
            if attempts > 0 {
                let request = RetryRequest {
                    job_id: job.id,
                    attempts,
                };
                if !self.retry.should_retry(&request) {
                    let message = failed
                        .last()
                        .and_then(|e| e.compute_state.message.clone())
                        .unwrap_or_else(|| "execution failed".to_string());
                    let reason = format!("partition {partition}: {message}");
                    builder.job_event(
                        Event::new(topics::JOB_FAILED)
                            .with_message(reason.clone())
                            .with_detail("partition", partition.to_string()),
                    );
                    failure = Some(reason);
                    continue;
                }
            }

            // The most recent failure without a replacement gets linked to
            // the first new execution.
            let mut replaced: Option<ExecutionId> = failed
                .iter()
                .rev()
                .find(|e| e.next_execution.is_none())
                .map(|e| e.id);

            // Nodes that semantically declined this partition are not asked
            // again. A capacity-race decline is transient: the node may be
            // re-asked once the capacity filter lets it through.
            let declined: HashSet<&NodeId> = executions
                .iter()
                .filter(|e| {
                    e.compute_state.state == ComputeState::AskForBidRejected
                        && e.compute_state.message.as_deref()
                            != Some(REASON_CAPACITY_UNAVAILABLE)
                })
                .map(|e| &e.node_id)
                .collect();

            let want = self.over_ask_for_bids_factor as usize;
            let mut placed = 0usize;
            for rank in &world.matched {
                if placed >= want {
                    break;
                }
                if used_nodes.contains(&rank.info.id) || declined.contains(&rank.info.id) {
                    continue;
                }
                let mut execution =
                    Execution::new(job, rank.info.id.clone(), evaluation.id, partition);
                if let Some(previous) = replaced.take() {
                    execution = execution.replacing(previous);
                    builder.update_execution(
                        UpdateExecutionRequest::new(previous).new_values(
                            ExecutionUpdate::default().next_execution(execution.id),
                        ),
                    );
                }
                used_nodes.insert(rank.info.id.clone());
                builder.create_execution(execution);
                placed += 1;
            }

            if placed == 0 {
                queued_partitions.push(failed.last().map(|e| e.id));
            }
        }

        // Partitions with no eligible node wait for the fleet to change
        // rather than failing the job.
        if !queued_partitions.is_empty() {
            let followup = Evaluation::new(job.id, &job.namespace, job.job_type, trigger::PERIODIC)
                .with_priority(job.priority);
            let followup = match chrono::Duration::from_std(self.queue_backoff) {
                Ok(backoff) => followup.with_wait_until(world.now + backoff),
                Err(_) => followup,
            };
            for failed_id in queued_partitions.iter().flatten() {
                builder.update_execution(
                    UpdateExecutionRequest::new(*failed_id)
                        .new_values(ExecutionUpdate::default().followup_eval(followup.id)),
                );
            }
            builder.job_event(Event::new(topics::JOB_QUEUED).with_message(format!(
                "{} partition(s) waiting for an eligible node",
                queued_partitions.len()
            )));
            builder.enqueue_evaluation(followup);
        }

        if let Some(reason) = failure {
            builder.fail_evaluation(reason);
        }

        Ok(builder.build())
    }
}
