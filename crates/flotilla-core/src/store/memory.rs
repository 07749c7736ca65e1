//! In-memory execution store.
//!
//! This module provides [`InMemoryExecutionStore`], an implementation of the
//! [`ExecutionStore`] contract suitable for tests and single-process
//! deployments.
//!
//! ## Limitations
//!
//! - **No durability**: All state is lost when the process exits; watcher
//!   checkpoints only survive restarts of the *consumer*, not of the store
//! - **Single-process only**: State is not shared across process boundaries
//! - **Unbounded change log**: The feed retains every change for the life of
//!   the process

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use super::{
    ChangeKind, ExecutionChange, ExecutionStore, ExecutionWatcher, NodeExecutionFilter,
    UpdateExecutionRequest,
};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::execution::Execution;
use crate::id::{ExecutionId, JobId, NodeId};

/// Converts a lock poison error to a datastore error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::datastore("execution store lock poisoned")
}

#[derive(Debug, Default)]
struct Inner {
    executions: HashMap<ExecutionId, Execution>,
    by_job: HashMap<JobId, Vec<ExecutionId>>,
    by_node: HashMap<NodeId, Vec<ExecutionId>>,
    execution_events: HashMap<ExecutionId, Vec<Event>>,
    job_events: HashMap<JobId, Vec<Event>>,
    changes: Vec<ExecutionChange>,
    next_seq: u64,
}

impl Inner {
    fn record_change(&mut self, kind: ChangeKind, execution: Execution) {
        self.next_seq += 1;
        self.changes.push(ExecutionChange {
            seq: self.next_seq,
            kind,
            execution,
        });
    }

    fn append_execution_events(&mut self, id: ExecutionId, events: Vec<Event>) {
        let stream = self.execution_events.entry(id).or_default();
        for mut event in events {
            event.seq = stream.len() as u64 + 1;
            stream.push(event);
        }
    }
}

#[derive(Debug)]
struct Shared {
    inner: RwLock<Inner>,
    feed: Notify,
}

/// In-memory, thread-safe implementation of the [`ExecutionStore`] contract.
///
/// ## Example
///
/// ```rust
/// use flotilla_core::store::memory::InMemoryExecutionStore;
///
/// let store = InMemoryExecutionStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryExecutionStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner::default()),
                feed: Notify::new(),
            }),
        }
    }

    /// Returns the number of executions currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn execution_count(&self) -> Result<usize> {
        let inner = self.shared.inner.read().map_err(poison_err)?;
        Ok(inner.executions.len())
    }

    /// Returns the `seq` of the newest change in the feed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn latest_seq(&self) -> Result<u64> {
        let inner = self.shared.inner.read().map_err(poison_err)?;
        Ok(inner.next_seq)
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, execution: Execution) -> Result<()> {
        execution.validate()?;
        {
            let mut inner = self.shared.inner.write().map_err(poison_err)?;
            if inner.executions.contains_key(&execution.id) {
                return Err(Error::ExecutionAlreadyExists { id: execution.id });
            }
            inner
                .by_job
                .entry(execution.job_id)
                .or_default()
                .push(execution.id);
            inner
                .by_node
                .entry(execution.node_id.clone())
                .or_default()
                .push(execution.id);
            inner.executions.insert(execution.id, execution.clone());
            inner.record_change(ChangeKind::Created, execution);
        }
        self.shared.feed.notify_waiters();
        Ok(())
    }

    async fn update_execution(&self, request: UpdateExecutionRequest) -> Result<Execution> {
        let updated = {
            let mut inner = self.shared.inner.write().map_err(poison_err)?;

            let Some(stored) = inner.executions.get(&request.execution_id) else {
                return Err(Error::not_found("execution", request.execution_id));
            };

            // Terminal fence comes before precondition checks: a caller
            // racing a terminal transition learns the record is closed, not
            // that its snapshot was stale.
            if stored.compute_state.state.is_terminal()
                && request.new_values.compute_state.is_some()
            {
                return Err(Error::ExecutionAlreadyTerminal {
                    id: stored.id,
                    state: stored.compute_state.state,
                });
            }

            let condition = &request.condition;
            if !condition.expected_states.is_empty()
                && !condition.expected_states.contains(&stored.compute_state.state)
            {
                return Err(Error::ConditionFailed {
                    id: stored.id,
                    message: format!(
                        "compute state is {}, expected one of {:?}",
                        stored.compute_state.state, condition.expected_states
                    ),
                });
            }
            if !condition.expected_desired_states.is_empty()
                && !condition
                    .expected_desired_states
                    .contains(&stored.desired_state.state)
            {
                return Err(Error::ConditionFailed {
                    id: stored.id,
                    message: format!(
                        "desired state is {}, expected one of {:?}",
                        stored.desired_state.state, condition.expected_desired_states
                    ),
                });
            }
            if let Some(expected) = condition.expected_revision {
                if expected != stored.revision {
                    return Err(Error::ConditionFailed {
                        id: stored.id,
                        message: format!(
                            "revision is {}, expected {expected}",
                            stored.revision
                        ),
                    });
                }
            }

            let execution_id = stored.id;
            let execution = inner
                .executions
                .get_mut(&request.execution_id)
                .expect("presence checked above");

            let new_values = request.new_values;
            if let Some(state) = new_values.compute_state {
                execution.compute_state = state;
            }
            if let Some(state) = new_values.desired_state {
                execution.desired_state = state;
            }
            if let Some(result) = new_values.run_result {
                execution.run_result = Some(result);
            }
            if let Some(result) = new_values.published_result {
                execution.published_result = result;
            }
            if let Some(next) = new_values.next_execution {
                execution.next_execution = Some(next);
            }
            if let Some(eval) = new_values.followup_eval_id {
                execution.followup_eval_id = Some(eval);
            }
            execution.revision += 1;
            execution.modify_time = Utc::now().max(execution.modify_time);

            let updated = execution.clone();
            inner.append_execution_events(execution_id, request.events);
            inner.record_change(ChangeKind::Updated, updated.clone());
            updated
        };
        self.shared.feed.notify_waiters();
        Ok(updated)
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Execution> {
        let inner = self.shared.inner.read().map_err(poison_err)?;
        inner
            .executions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("execution", id))
    }

    async fn get_executions(&self, job_id: &JobId) -> Result<Vec<Execution>> {
        let inner = self.shared.inner.read().map_err(poison_err)?;
        let ids = inner.by_job.get(job_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.executions.get(id).cloned())
            .collect())
    }

    async fn get_executions_by_node(
        &self,
        node_id: &NodeId,
        filter: NodeExecutionFilter,
    ) -> Result<Vec<Execution>> {
        let inner = self.shared.inner.read().map_err(poison_err)?;
        let ids = inner.by_node.get(node_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.executions.get(id))
            .filter(|e| filter == NodeExecutionFilter::All || !e.is_terminal())
            .cloned()
            .collect())
    }

    async fn watch(&self, from_seq: u64) -> Result<Box<dyn ExecutionWatcher>> {
        Ok(Box::new(MemoryWatcher {
            shared: Arc::clone(&self.shared),
            cursor: from_seq,
        }))
    }

    async fn execution_events(&self, id: &ExecutionId) -> Result<Vec<Event>> {
        let inner = self.shared.inner.read().map_err(poison_err)?;
        Ok(inner.execution_events.get(id).cloned().unwrap_or_default())
    }

    async fn job_events(&self, job_id: &JobId) -> Result<Vec<Event>> {
        let inner = self.shared.inner.read().map_err(poison_err)?;
        Ok(inner.job_events.get(job_id).cloned().unwrap_or_default())
    }

    async fn append_job_events(&self, job_id: JobId, events: Vec<Event>) -> Result<()> {
        let mut inner = self.shared.inner.write().map_err(poison_err)?;
        let stream = inner.job_events.entry(job_id).or_default();
        for mut event in events {
            event.seq = stream.len() as u64 + 1;
            stream.push(event);
        }
        Ok(())
    }
}

/// Change-feed cursor over the in-memory store.
struct MemoryWatcher {
    shared: Arc<Shared>,
    cursor: u64,
}

impl MemoryWatcher {
    fn poll_next(&self) -> Result<Option<ExecutionChange>> {
        let inner = self.shared.inner.read().map_err(poison_err)?;
        Ok(inner
            .changes
            .iter()
            .find(|c| c.seq > self.cursor)
            .cloned())
    }
}

#[async_trait]
impl ExecutionWatcher for MemoryWatcher {
    async fn next(&mut self) -> Result<ExecutionChange> {
        loop {
            // Register for wake-up before checking the feed so an append
            // between the check and the await is not lost.
            let mut notified = Box::pin(self.shared.feed.notified());
            notified.as_mut().enable();
            if let Some(change) = self.poll_next()? {
                self.cursor = change.seq;
                return Ok(change);
            }
            notified.await;
        }
    }

    fn checkpoint(&self) -> u64 {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::topics;
    use crate::execution::{ComputeState, DesiredState, State};
    use crate::job::{Job, JobType, Task};
    use crate::spec_config::SpecConfig;
    use crate::store::{ExecutionUpdate, UpdateCondition};
    use crate::id::EvalId;

    fn create_test_execution() -> Execution {
        let job = Job::new(
            "test-job",
            "default",
            JobType::Batch,
            Task::new("main", SpecConfig::new("noop")),
        );
        Execution::new(&job, NodeId::new("n1"), EvalId::generate(), 0)
    }

    fn compute_transition(id: ExecutionId, from: ComputeState, to: ComputeState) -> UpdateExecutionRequest {
        UpdateExecutionRequest::new(id)
            .condition(UpdateCondition::default().expect_states([from]))
            .new_values(ExecutionUpdate::default().compute_state(State::new(to)))
    }

    #[tokio::test]
    async fn create_and_get() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let execution = create_test_execution();
        let id = execution.id;

        store.create_execution(execution).await?;
        let fetched = store.get_execution(&id).await?;
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.revision, 1);

        Ok(())
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let execution = create_test_execution();

        store.create_execution(execution.clone()).await?;
        let err = store.create_execution(execution).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionAlreadyExists { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn update_bumps_revision_and_modify_time() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let execution = create_test_execution();
        let id = execution.id;
        store.create_execution(execution).await?;

        let updated = store
            .update_execution(compute_transition(id, ComputeState::New, ComputeState::AskForBid))
            .await?;

        assert_eq!(updated.revision, 2);
        assert_eq!(updated.compute_state.state, ComputeState::AskForBid);
        assert!(updated.modify_time >= updated.create_time);

        Ok(())
    }

    #[tokio::test]
    async fn condition_mismatch_leaves_state_unchanged() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let execution = create_test_execution();
        let id = execution.id;
        store.create_execution(execution).await?;

        let err = store
            .update_execution(compute_transition(
                id,
                ComputeState::Running, // stored state is New
                ComputeState::Publishing,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConditionFailed { .. }));

        let stored = store.get_execution(&id).await?;
        assert_eq!(stored.compute_state.state, ComputeState::New);
        assert_eq!(stored.revision, 1);

        Ok(())
    }

    #[tokio::test]
    async fn revision_condition_detects_concurrent_writer() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let execution = create_test_execution();
        let id = execution.id;
        store.create_execution(execution).await?;

        let request = UpdateExecutionRequest::new(id)
            .condition(UpdateCondition::default().expect_revision(1))
            .new_values(
                ExecutionUpdate::default().desired_state(State::new(DesiredState::Running)),
            );
        store.update_execution(request.clone()).await?;

        // Replaying the same revision-conditioned update must now fail.
        let err = store.update_execution(request).await.unwrap_err();
        assert!(matches!(err, Error::ConditionFailed { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn terminal_execution_refuses_compute_transitions() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let execution = create_test_execution();
        let id = execution.id;
        store.create_execution(execution).await?;

        store
            .update_execution(
                UpdateExecutionRequest::new(id).new_values(
                    ExecutionUpdate::default()
                        .compute_state(State::new(ComputeState::Cancelled)),
                ),
            )
            .await?;

        let err = store
            .update_execution(compute_transition(id, ComputeState::Cancelled, ComputeState::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionAlreadyTerminal { .. }));

        // Desired-state-only updates still land on a compute-terminal record.
        store
            .update_execution(
                UpdateExecutionRequest::new(id).new_values(
                    ExecutionUpdate::default().desired_state(State::new(DesiredState::Stopped)),
                ),
            )
            .await?;

        Ok(())
    }

    #[tokio::test]
    async fn events_append_with_monotone_seq() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let execution = create_test_execution();
        let id = execution.id;
        store.create_execution(execution).await?;

        store
            .update_execution(
                UpdateExecutionRequest::new(id)
                    .new_values(
                        ExecutionUpdate::default()
                            .compute_state(State::new(ComputeState::AskForBid)),
                    )
                    .with_event(Event::new(topics::EXEC_BID_OFFERED))
                    .with_event(Event::new(topics::EXEC_BID_ACCEPTED)),
            )
            .await?;

        let events = store.execution_events(&id).await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);

        Ok(())
    }

    #[tokio::test]
    async fn job_queries_return_all_partitions() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let job = Job::new(
            "spread",
            "default",
            JobType::Batch,
            Task::new("main", SpecConfig::new("noop")),
        )
        .with_count(3);

        for partition in 0..3 {
            let execution =
                Execution::new(&job, NodeId::new("n1"), EvalId::generate(), partition);
            store.create_execution(execution).await?;
        }

        let executions = store.get_executions(&job.id).await?;
        assert_eq!(executions.len(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn node_query_filters_terminal() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let node = NodeId::new("n1");

        let live = create_test_execution();
        let done = create_test_execution();
        let done_id = done.id;
        store.create_execution(live).await?;
        store.create_execution(done).await?;

        store
            .update_execution(
                UpdateExecutionRequest::new(done_id).new_values(
                    ExecutionUpdate::default()
                        .compute_state(State::new(ComputeState::Completed)),
                ),
            )
            .await?;

        let non_terminal = store
            .get_executions_by_node(&node, NodeExecutionFilter::NonTerminal)
            .await?;
        assert_eq!(non_terminal.len(), 1);

        let all = store
            .get_executions_by_node(&node, NodeExecutionFilter::All)
            .await?;
        assert_eq!(all.len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn watcher_sees_changes_in_order_and_resumes() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let execution = create_test_execution();
        let id = execution.id;

        let mut watcher = store.watch(0).await?;
        store.create_execution(execution).await?;
        store
            .update_execution(compute_transition(id, ComputeState::New, ComputeState::AskForBid))
            .await?;

        let first = watcher.next().await?;
        assert_eq!(first.kind, ChangeKind::Created);
        assert_eq!(first.seq, 1);

        let second = watcher.next().await?;
        assert_eq!(second.kind, ChangeKind::Updated);
        assert_eq!(second.seq, 2);
        assert_eq!(second.execution.compute_state.state, ComputeState::AskForBid);

        // Resuming from the checkpoint replays nothing already seen.
        let checkpoint = watcher.checkpoint();
        let mut resumed = store.watch(checkpoint).await?;
        store
            .update_execution(compute_transition(
                id,
                ComputeState::AskForBid,
                ComputeState::AskForBidAccepted,
            ))
            .await?;
        let third = resumed.next().await?;
        assert_eq!(third.seq, 3);

        Ok(())
    }

    #[tokio::test]
    async fn watcher_wakes_on_append() -> Result<()> {
        let store = InMemoryExecutionStore::new();
        let mut watcher = store.watch(0).await?;

        let writer = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            writer.create_execution(create_test_execution()).await
        });

        let change = tokio::time::timeout(std::time::Duration::from_secs(2), watcher.next())
            .await
            .expect("watcher should wake")?;
        assert_eq!(change.kind, ChangeKind::Created);
        handle.await.expect("writer task")?;

        Ok(())
    }
}
