//! Store watcher: turns execution changes into follow-up evaluations.
//!
//! Compute nodes report outcomes by writing compute state into the store;
//! nobody calls the orchestrator back. This watcher closes the loop: when an
//! execution fails or a node declines to bid, it enqueues an
//! `execution-failed` evaluation so the scheduler can place a replacement.
//!
//! Restart-safe: the watcher checkpoints the change-feed `seq` it has
//! processed and resumes from it, de-duplicating by execution ID.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use flotilla_core::error::Result;
use flotilla_core::evaluation::{trigger, Evaluation};
use flotilla_core::execution::ComputeState;
use flotilla_core::id::ExecutionId;
use flotilla_core::store::{ExecutionChange, ExecutionStore};

use crate::broker::EvaluationBroker;
use crate::state::EvaluationSet;

/// Watches the execution store and enqueues follow-up evaluations.
pub struct StoreWatcher {
    store: Arc<dyn ExecutionStore>,
    broker: EvaluationBroker,
    evaluations: Arc<EvaluationSet>,
    triggered: HashSet<ExecutionId>,
    checkpoint: u64,
}

impl StoreWatcher {
    /// Creates a watcher resuming from `checkpoint` (0 for a fresh start).
    #[must_use]
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        broker: EvaluationBroker,
        evaluations: Arc<EvaluationSet>,
        checkpoint: u64,
    ) -> Self {
        Self {
            store,
            broker,
            evaluations,
            triggered: HashSet::new(),
            checkpoint,
        }
    }

    /// The `seq` of the last processed change.
    #[must_use]
    pub const fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// Consumes the change feed until the token is cancelled.
    ///
    /// # Errors
    ///
    /// Propagates store watch failures.
    pub async fn run(&mut self, token: CancellationToken) -> Result<()> {
        let mut watch = self.store.watch(self.checkpoint).await?;
        loop {
            let change = tokio::select! {
                () = token.cancelled() => return Ok(()),
                change = watch.next() => change?,
            };
            self.checkpoint = change.seq;
            if let Err(error) = self.handle(&change) {
                tracing::warn!(%error, seq = change.seq, "store watcher failed to react to change");
            }
        }
    }

    /// Reacts to one change; public so tests can drive the feed by hand.
    ///
    /// # Errors
    ///
    /// Propagates broker enqueue failures.
    pub fn handle(&mut self, change: &ExecutionChange) -> Result<()> {
        let execution = &change.execution;
        let needs_replacement = matches!(
            execution.compute_state.state,
            ComputeState::Failed | ComputeState::AskForBidRejected
        );
        if !needs_replacement
            || execution.next_execution.is_some()
            || self.triggered.contains(&execution.id)
        {
            return Ok(());
        }
        self.triggered.insert(execution.id);

        let evaluation = Evaluation::new(
            execution.job_id,
            &execution.namespace,
            execution.job.job_type,
            trigger::EXECUTION_FAILED,
        )
        .with_priority(execution.job.priority);
        tracing::debug!(
            eval_id = %evaluation.id,
            job_id = %execution.job_id,
            execution_id = %execution.id,
            state = %execution.compute_state.state,
            "enqueueing follow-up evaluation"
        );
        self.evaluations.insert(evaluation.clone())?;
        self.broker.enqueue(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use flotilla_core::execution::{Execution, State};
    use flotilla_core::id::EvalId;
    use flotilla_core::job::{Job, JobType, Task};
    use flotilla_core::spec_config::SpecConfig;
    use flotilla_core::store::memory::InMemoryExecutionStore;
    use flotilla_core::store::ChangeKind;
    use std::time::Duration;

    fn watcher() -> (StoreWatcher, EvaluationBroker) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let broker = EvaluationBroker::new(BrokerConfig::default());
        let watcher = StoreWatcher::new(
            store,
            broker.clone(),
            Arc::new(EvaluationSet::new()),
            0,
        );
        (watcher, broker)
    }

    fn change(state: ComputeState) -> ExecutionChange {
        let job = Job::new(
            "j",
            "default",
            JobType::Batch,
            Task::new("main", SpecConfig::new("noop")),
        );
        let mut execution = Execution::new(&job, "n1".into(), EvalId::generate(), 0);
        execution.compute_state = State::new(state);
        ExecutionChange {
            seq: 1,
            kind: ChangeKind::Updated,
            execution,
        }
    }

    #[tokio::test]
    async fn failed_execution_triggers_followup() -> Result<()> {
        let (mut watcher, broker) = watcher();
        watcher.handle(&change(ComputeState::Failed))?;

        let delivered = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("follow-up evaluation");
        assert_eq!(delivered.0.triggered_by, trigger::EXECUTION_FAILED);

        Ok(())
    }

    #[tokio::test]
    async fn completed_execution_triggers_nothing() -> Result<()> {
        let (mut watcher, broker) = watcher();
        watcher.handle(&change(ComputeState::Completed))?;
        watcher.handle(&change(ComputeState::Running))?;

        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(50))
            .await?
            .is_none());

        Ok(())
    }

    #[tokio::test]
    async fn repeated_changes_for_one_failure_deduplicate() -> Result<()> {
        let (mut watcher, broker) = watcher();
        let failed = change(ComputeState::Failed);
        watcher.handle(&failed)?;
        watcher.handle(&failed)?;

        let (delivered, receipt) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("first follow-up");
        // Ack frees the job slot; a duplicate would now be deliverable.
        broker.ack(&delivered.id, &receipt)?;
        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(50))
            .await?
            .is_none());

        Ok(())
    }
}
