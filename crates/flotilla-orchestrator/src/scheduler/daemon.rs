//! Daemon and ops scheduling policy.
//!
//! These job families place one execution per eligible node rather than per
//! partition: executions are added as nodes become eligible and stopped when
//! their node leaves the fleet. Ops jobs run to completion once per node;
//! daemon jobs are kept running.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use flotilla_core::error::Result;
use flotilla_core::evaluation::Evaluation;
use flotilla_core::event::{topics, Event};
use flotilla_core::execution::{ComputeState, Execution, REASON_CAPACITY_UNAVAILABLE};
use flotilla_core::id::{ExecutionId, NodeId};
use flotilla_core::store::{ExecutionUpdate, UpdateExecutionRequest};

use crate::plan::{Plan, PlanBuilder};
use crate::retry::{RetryRequest, RetryStrategy};
use crate::scheduler::{Scheduler, World};

/// Scheduler for `Daemon` and `Ops` jobs.
pub struct DaemonOpsScheduler {
    retry: Arc<dyn RetryStrategy>,
}

impl DaemonOpsScheduler {
    /// Creates the scheduler.
    #[must_use]
    pub fn new(retry: Arc<dyn RetryStrategy>) -> Self {
        Self { retry }
    }
}

impl Scheduler for DaemonOpsScheduler {
    fn process(&self, evaluation: &Evaluation, world: &World) -> Result<Plan> {
        let job = &world.job;
        let mut builder = PlanBuilder::new(evaluation);
        let mut stopped: HashSet<ExecutionId> = HashSet::new();

        // Stop executions whose node left the fleet. Capacity or label
        // drift does not evict a running per-node execution; only loss of
        // membership or connection does.
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

        let mut by_node: HashMap<&NodeId, Vec<&Execution>> = HashMap::new();
        for execution in &world.executions {
            by_node.entry(&execution.node_id).or_default().push(execution);
        }

        for rank in &world.matched {
            let node_executions = by_node.get(&rank.info.id).map_or(&[][..], Vec::as_slice);
            let active: Vec<&Execution> = node_executions
                .iter()
                .copied()
                .filter(|e| !e.is_terminal() && !stopped.contains(&e.id))
                .collect();

            // An accepted bid on this node just needs approval.
            if let Some(accepted) = active
                .iter()
                .find(|e| e.compute_state.state == ComputeState::AskForBidAccepted)
            {
                builder.approve_execution(
                    accepted.id,
                    vec![ComputeState::AskForBidAccepted],
                    vec![Event::new(topics::EXEC_BID_ACCEPTED)],
                );
                continue;
            }
            if !active.is_empty() {
                continue;
            }

            // A node that semantically declined this job is not asked
            // again; a capacity-race decline may be retried.
            if node_executions.iter().any(|e| {
                e.compute_state.state == ComputeState::AskForBidRejected
                    && e.compute_state.message.as_deref() != Some(REASON_CAPACITY_UNAVAILABLE)
            }) {
                continue;
            }

            // Ops jobs run once per node; a completed execution settles it.
            if job.job_type.completion_is_terminal()
                && node_executions
                    .iter()
                    .any(|e| e.compute_state.state == ComputeState::Completed)
            {
                continue;
            }

            // Failures on this node consume the retry budget.
            let failed: Vec<&Execution> = node_executions
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
                    continue;
                }
            }

            let mut execution = Execution::new(job, rank.info.id.clone(), evaluation.id, 0);
            if let Some(previous) = failed
                .iter()
                .rev()
                .find(|e| e.next_execution.is_none())
                .map(|e| e.id)
            {
                execution = execution.replacing(previous);
                builder.update_execution(
                    UpdateExecutionRequest::new(previous)
                        .new_values(ExecutionUpdate::default().next_execution(execution.id)),
                );
            }
            builder.create_execution(execution);
        }

        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::AttemptCountStrategy;
    use crate::selection::NodeRank;
    use chrono::Utc;
    use flotilla_core::evaluation::trigger;
    use flotilla_core::execution::State;
    use flotilla_core::id::EvalId;
    use flotilla_core::job::{Job, JobType, Task};
    use flotilla_core::node::NodeInfo;
    use flotilla_core::resources::Resources;
    use flotilla_core::spec_config::SpecConfig;

    fn daemon_job() -> Job {
        Job::new(
            "agent",
            "default",
            JobType::Daemon,
            Task::new("main", SpecConfig::new("noop")),
        )
    }

    fn rank(name: &str) -> NodeRank {
        NodeRank {
            info: NodeInfo::compute(name.into(), Resources::new(4000, 0, 0, 0))
                .with_engine("noop"),
            score: 1.0,
            meets_requirements: true,
            reason: String::new(),
        }
    }

    fn world(job: Job, executions: Vec<Execution>, matched: Vec<NodeRank>) -> World {
        let healthy_nodes = matched.iter().map(|r| r.info.id.clone()).collect();
        World {
            job,
            executions,
            matched,
            rejected: vec![],
            healthy_nodes,
            now: Utc::now(),
        }
    }

    fn scheduler() -> DaemonOpsScheduler {
        DaemonOpsScheduler::new(Arc::new(AttemptCountStrategy::default()))
    }

    #[test]
    fn places_one_execution_per_eligible_node() {
        let job = daemon_job();
        let evaluation = Evaluation::new(job.id, "default", job.job_type, trigger::JOB_REGISTER);
        let world = world(job.clone(), vec![], vec![rank("n1"), rank("n2"), rank("n3")]);

        let plan = scheduler().process(&evaluation, &world).unwrap();
        assert_eq!(plan.new_executions.len(), 3);
    }

    #[test]
    fn nodes_with_live_executions_are_skipped() {
        let job = daemon_job();
        let evaluation = Evaluation::new(job.id, "default", job.job_type, trigger::NODE_JOIN);
        let mut running = Execution::new(&job, "n1".into(), EvalId::generate(), 0);
        running.compute_state = State::new(ComputeState::Running);
        let world = world(job.clone(), vec![running], vec![rank("n1"), rank("n2")]);

        let plan = scheduler().process(&evaluation, &world).unwrap();
        assert_eq!(plan.new_executions.len(), 1);
        assert_eq!(plan.new_executions[0].node_id.as_str(), "n2");
    }

    #[test]
    fn lost_node_executions_are_stopped() {
        let job = daemon_job();
        let evaluation = Evaluation::new(job.id, "default", job.job_type, trigger::NODE_DRAIN);
        let mut running = Execution::new(&job, "drained".into(), EvalId::generate(), 0);
        running.compute_state = State::new(ComputeState::Running);
        let running_id = running.id;
        let world = world(job.clone(), vec![running], vec![rank("n1")]);

        let plan = scheduler().process(&evaluation, &world).unwrap();
        assert!(plan
            .stopped_executions
            .iter()
            .any(|s| s.execution_id == running_id));
        // And the eligible node gets its own execution.
        assert_eq!(plan.new_executions.len(), 1);
        assert_eq!(plan.new_executions[0].node_id.as_str(), "n1");
    }

    #[test]
    fn completed_ops_node_is_not_replaced() {
        let mut job = daemon_job();
        job.job_type = JobType::Ops;
        let evaluation = Evaluation::new(job.id, "default", job.job_type, trigger::PERIODIC);
        let mut done = Execution::new(&job, "n1".into(), EvalId::generate(), 0);
        done.compute_state = State::new(ComputeState::Completed);
        let world = world(job.clone(), vec![done], vec![rank("n1")]);

        let plan = scheduler().process(&evaluation, &world).unwrap();
        assert!(plan.new_executions.is_empty());
    }

    #[test]
    fn completed_daemon_node_is_restarted() {
        let job = daemon_job();
        let evaluation = Evaluation::new(job.id, "default", job.job_type, trigger::PERIODIC);
        let mut done = Execution::new(&job, "n1".into(), EvalId::generate(), 0);
        done.compute_state = State::new(ComputeState::Completed);
        let world = world(job.clone(), vec![done], vec![rank("n1")]);

        let plan = scheduler().process(&evaluation, &world).unwrap();
        assert_eq!(plan.new_executions.len(), 1);
    }
}
