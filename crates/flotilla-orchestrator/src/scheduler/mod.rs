//! Schedulers: pure `(evaluation, world) -> plan` policies.
//!
//! A scheduler never mutates state. It reads a [`World`] snapshot — the job,
//! its executions, the ranked nodes — and proposes a [`Plan`]; the planner
//! applies it. That split keeps every placement decision replayable from its
//! inputs.

pub mod batch;
pub mod daemon;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use flotilla_core::error::{Error, Result};
use flotilla_core::evaluation::Evaluation;
use flotilla_core::execution::Execution;
use flotilla_core::id::NodeId;
use flotilla_core::job::{Job, JobType};
use flotilla_core::resources::Resources;
use flotilla_core::store::{ExecutionStore, NodeExecutionFilter};

use crate::plan::Plan;
use crate::selection::{NodeRank, NodeSelector};
use crate::state::JobSet;

/// Everything a scheduler may look at for one evaluation.
///
/// A read-only snapshot assembled by [`WorldBuilder`]; schedulers treat the
/// embedded job as copy-on-read and never hold it past the scheduling pass.
#[derive(Debug, Clone)]
pub struct World {
    /// The job under evaluation.
    pub job: Job,
    /// Every execution of the job, oldest first.
    pub executions: Vec<Execution>,
    /// Nodes able to run the job, best first.
    pub matched: Vec<NodeRank>,
    /// Nodes that cannot, with reasons.
    pub rejected: Vec<NodeRank>,
    /// Nodes currently approved and connected, regardless of fit.
    pub healthy_nodes: HashSet<NodeId>,
    /// The scheduling pass's clock reading.
    pub now: DateTime<Utc>,
}

/// Processes one evaluation into a plan.
pub trait Scheduler: Send + Sync {
    /// Produces the plan for an evaluation against the current world.
    ///
    /// # Errors
    ///
    /// Returns an error when the world is inconsistent with the evaluation;
    /// transient errors are retried by the worker via nack.
    fn process(&self, evaluation: &Evaluation, world: &World) -> Result<Plan>;
}

/// Maps job types to the scheduler that handles them.
#[derive(Default)]
pub struct SchedulerProvider {
    schedulers: HashMap<JobType, Arc<dyn Scheduler>>,
}

impl SchedulerProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a scheduler for a job type, replacing any previous one.
    #[must_use]
    pub fn with_scheduler(mut self, job_type: JobType, scheduler: Arc<dyn Scheduler>) -> Self {
        self.schedulers.insert(job_type, scheduler);
        self
    }

    /// Returns the scheduler for a job type.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when no scheduler handles the type.
    pub fn scheduler(&self, job_type: JobType) -> Result<Arc<dyn Scheduler>> {
        self.schedulers
            .get(&job_type)
            .cloned()
            .ok_or_else(|| Error::not_found("scheduler", job_type))
    }

    /// The job types this provider can schedule, for broker dequeue.
    #[must_use]
    pub fn enabled_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.schedulers.keys().copied().collect();
        types.sort_by_key(|t| t.to_string());
        types
    }
}

/// Assembles [`World`] snapshots for the workers.
pub struct WorldBuilder {
    jobs: Arc<JobSet>,
    store: Arc<dyn ExecutionStore>,
    selector: Arc<NodeSelector>,
}

impl WorldBuilder {
    /// Creates a builder over the orchestrator's state.
    #[must_use]
    pub fn new(
        jobs: Arc<JobSet>,
        store: Arc<dyn ExecutionStore>,
        selector: Arc<NodeSelector>,
    ) -> Self {
        Self {
            jobs,
            store,
            selector,
        }
    }

    /// Builds the world for one evaluation.
    ///
    /// Commits of live executions (across all jobs) are summed per node and
    /// subtracted from advertised capacity during selection, so concurrent
    /// placements cannot oversubscribe a node.
    ///
    /// # Errors
    ///
    /// Propagates job lookup, store and discovery failures.
    pub async fn build(&self, evaluation: &Evaluation) -> Result<World> {
        let job = self.jobs.get(&evaluation.job_id)?;
        let executions = self.store.get_executions(&evaluation.job_id).await?;

        let nodes = self.selector.all_nodes().await?;
        let mut committed: HashMap<NodeId, Resources> = HashMap::new();
        let mut healthy_nodes = HashSet::new();
        for node in &nodes {
            if node.is_eligible() {
                healthy_nodes.insert(node.info.id.clone());
            }
            let live = self
                .store
                .get_executions_by_node(&node.info.id, NodeExecutionFilter::NonTerminal)
                .await?;
            let used = live
                .iter()
                .fold(Resources::default(), |acc, e| {
                    acc.add(&e.total_allocated_resources())
                });
            if !used.is_zero() {
                committed.insert(node.info.id.clone(), used);
            }
        }

        let (matched, rejected) = self.selector.matching_nodes(&job, &committed).await?;

        Ok(World {
            job,
            executions,
            matched,
            rejected,
            healthy_nodes,
            now: Utc::now(),
        })
    }
}
