//! The execution runner: one accepted bid, driven to a terminal state.
//!
//! The pipeline inside the running phase, in order: stage inputs (in
//! parallel), allocate ports, resolve the environment, transition the store
//! to `Running`, start the backend, wait bounded by the task's execution
//! timeout, publish if a publisher is configured, mark completed. Every
//! failure funnels through one handler that writes `Failed` unless the
//! record already went terminal (a cancel won the race).
//!
//! Re-entry is idempotent: the `Running` transition accepts `Running` as a
//! prior state, and a backend reporting `AlreadyStarted` falls through to
//! waiting on the original run.

use std::sync::Arc;

use metrics::counter;

use flotilla_core::error::{Error, Result};
use flotilla_core::event::{topics, Event};
use flotilla_core::execution::{ComputeState, Execution, RunResult, State};
use flotilla_core::id::NodeId;
use flotilla_core::network::NetworkKind;
use flotilla_core::spec_config::SpecConfig;
use flotilla_core::store::{
    ExecutionStore, ExecutionUpdate, UpdateCondition, UpdateExecutionRequest,
};

use crate::capability::{
    BackendError, ExecutorBackend, PreparedStorage, Provider, ResultPublisher, RunSpec,
    StorageMount,
};
use crate::capacity::CapacityTracker;
use crate::config::ComputeConfig;
use crate::env::EnvResolver;
use crate::ports::PortAllocator;
use crate::results::ResultsPath;

/// Counter: executions this node ran to completion.
const EXECUTIONS_COMPLETED_TOTAL: &str = "flotilla_compute_executions_completed_total";
/// Counter: executions this node failed.
const EXECUTIONS_FAILED_TOTAL: &str = "flotilla_compute_executions_failed_total";

/// A staged input paired with the mount that can clean it.
struct StagedInput {
    mount: Arc<dyn StorageMount>,
    prepared: PreparedStorage,
}

/// How a run ended, failure aside.
enum RunOutcome {
    /// The execution completed (and published, if configured).
    Completed,
    /// The backend reported the run cancelled; the watch loop's cancel
    /// path owns the terminal transition.
    Cancelled,
}

/// Drives one execution from `BidAccepted` to a terminal state.
pub struct ExecutionRunner {
    node_id: NodeId,
    store: Arc<dyn ExecutionStore>,
    executors: Arc<Provider<dyn ExecutorBackend>>,
    storages: Arc<Provider<dyn StorageMount>>,
    publishers: Arc<Provider<dyn ResultPublisher>>,
    ports: Arc<PortAllocator>,
    env: EnvResolver,
    results: ResultsPath,
    capacity: Arc<CapacityTracker>,
    config: ComputeConfig,
}

impl ExecutionRunner {
    /// Creates a runner over the node's capability registries.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn ExecutionStore>,
        executors: Arc<Provider<dyn ExecutorBackend>>,
        storages: Arc<Provider<dyn StorageMount>>,
        publishers: Arc<Provider<dyn ResultPublisher>>,
        ports: Arc<PortAllocator>,
        env: EnvResolver,
        results: ResultsPath,
        capacity: Arc<CapacityTracker>,
        config: ComputeConfig,
    ) -> Self {
        Self {
            node_id,
            store,
            executors,
            storages,
            publishers,
            ports,
            env,
            results,
            capacity,
            config,
        }
    }

    /// Runs the execution to a terminal state, cleaning up on every path.
    pub async fn run(&self, execution: Execution) {
        let mut staged: Vec<StagedInput> = Vec::new();
        let outcome = self.run_inner(&execution, &mut staged).await;

        match outcome {
            Ok(RunOutcome::Completed) => {
                counter!(EXECUTIONS_COMPLETED_TOTAL).increment(1);
                tracing::debug!(
                    execution_id = %execution.id,
                    job_id = %execution.job_id,
                    "run complete"
                );
            }
            Ok(RunOutcome::Cancelled) => {
                tracing::debug!(
                    execution_id = %execution.id,
                    job_id = %execution.job_id,
                    "run cancelled"
                );
            }
            Err(error) => {
                counter!(EXECUTIONS_FAILED_TOTAL).increment(1);
                self.handle_failure(&execution, &error).await;
            }
        }

        for staged in staged {
            if let Err(error) = staged.mount.clean(&staged.prepared).await {
                tracing::warn!(
                    execution_id = %execution.id,
                    %error,
                    "failed to clean staged input"
                );
            }
        }
        self.ports.release(&execution.id);
        self.capacity.release(&execution.id);
        self.results
            .schedule_root_cleanup(execution.id, self.config.root_cleanup_delay);
    }

    /// Cancels the in-flight run via the backend's explicit cancel call.
    ///
    /// Advisory backend responses (never started, already cancelled) are
    /// not errors.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend cannot stop the run.
    pub async fn cancel(&self, execution: &Execution) -> Result<()> {
        let executor = self.executors.get(&execution.job.task().engine.kind)?;
        match executor.cancel(execution.id).await {
            Ok(()) | Err(BackendError::AlreadyCancelled | BackendError::NotFound) => Ok(()),
            Err(error) => Err(Error::internal(format!(
                "cancelling execution {}: {error}",
                execution.id
            ))),
        }
    }

    async fn run_inner(
        &self,
        execution: &Execution,
        staged: &mut Vec<StagedInput>,
    ) -> Result<RunOutcome> {
        let task = execution.job.task();
        let executor = self.executors.get(&task.engine.kind)?;

        let execution_dir = self
            .results
            .prepare_execution_output_dir(execution.id)
            .await?;

        // Stage every input in parallel; registrations for cleanup go into
        // `staged` as they succeed.
        let inputs_dir = self.results.execution_inputs_dir(execution.id);
        let prepares = task.input_sources.iter().map(|input| {
            let mount = self.storages.get(&input.source.kind);
            let inputs_dir = inputs_dir.clone();
            async move {
                let mount = mount?;
                let prepared = mount.prepare(execution.id, input, &inputs_dir).await?;
                Ok::<StagedInput, Error>(StagedInput { mount, prepared })
            }
        });
        let mut inputs = Vec::with_capacity(task.input_sources.len());
        let mut stage_error = None;
        for outcome in futures::future::join_all(prepares).await {
            // Register every success for cleanup before surfacing a
            // failure, or volumes staged after the failing one would leak.
            match outcome {
                Ok(staged_input) => {
                    inputs.push(staged_input.prepared.clone());
                    staged.push(staged_input);
                }
                Err(error) => {
                    stage_error.get_or_insert(error);
                }
            }
        }
        if let Some(error) = stage_error {
            return Err(error);
        }

        let ports = self.ports.allocate(execution.id, &task.network.ports)?;

        let env = self.env.resolve(task)?;

        let mut network = task.network.clone();
        if network.kind == NetworkKind::Default {
            network.kind = self.config.default_network_type;
        }

        // Allow `Running` as a prior state so a crash-restarted node can
        // re-enter without tripping its own precondition.
        self.store
            .update_execution(
                UpdateExecutionRequest::new(execution.id)
                    .condition(UpdateCondition::default().expect_states([
                        ComputeState::BidAccepted,
                        ComputeState::Running,
                    ]))
                    .new_values(
                        ExecutionUpdate::default()
                            .compute_state(State::new(ComputeState::Running)),
                    )
                    .with_event(
                        Event::new(topics::EXEC_RUNNING)
                            .with_detail("node", self.node_id.to_string()),
                    ),
            )
            .await?;

        let spec = RunSpec {
            job_id: execution.job_id,
            execution_id: execution.id,
            resources: execution.total_allocated_resources(),
            network,
            ports,
            outputs: task.result_paths.clone(),
            inputs,
            execution_dir,
            engine: task.engine.clone(),
            env,
            output_limits: self.config.output_limits,
        };

        match executor.start(spec).await {
            Ok(()) => {}
            // Duplicate starts fall through to waiting on the original run.
            Err(BackendError::AlreadyStarted) => {
                tracing::warn!(
                    execution_id = %execution.id,
                    "execution already started, proceeding to wait"
                );
            }
            Err(error) => {
                return Err(Error::internal(format!("starting execution: {error}")));
            }
        }

        let Some(result) = self.wait(executor.as_ref(), execution).await? else {
            return Ok(RunOutcome::Cancelled);
        };
        if !result.error_message.is_empty() {
            return Err(Error::internal(result.error_message));
        }
        if result.exit_code != 0 {
            return Err(Error::internal(format!(
                "task exited with code {}",
                result.exit_code
            )));
        }

        let mut expected = ComputeState::Running;
        let mut published: Option<SpecConfig> = None;

        if task.has_publisher() {
            self.store
                .update_execution(
                    UpdateExecutionRequest::new(execution.id)
                        .condition(UpdateCondition::default().expect_states([expected]))
                        .new_values(
                            ExecutionUpdate::default()
                                .compute_state(State::new(ComputeState::Publishing))
                                .run_result(result.clone()),
                        )
                        .with_event(Event::new(topics::EXEC_PUBLISHING)),
                )
                .await?;
            expected = ComputeState::Publishing;

            let publisher = self.publishers.get(&task.publisher.kind)?;
            let results_dir = self.results.execution_results_dir(execution.id);
            published = Some(publisher.publish_result(execution, &results_dir).await?);
        }

        let mut completion = ExecutionUpdate::default()
            .compute_state(State::new(ComputeState::Completed))
            .run_result(result);
        if let Some(artifact) = published {
            completion = completion.published_result(artifact);
        }
        self.store
            .update_execution(
                UpdateExecutionRequest::new(execution.id)
                    .condition(UpdateCondition::default().expect_states([expected]))
                    .new_values(completion)
                    .with_event(Event::new(topics::EXEC_COMPLETED)),
            )
            .await?;

        Ok(RunOutcome::Completed)
    }

    /// Waits for the backend, bounded by the task's execution timeout.
    ///
    /// Returns `None` when the backend reports the run was cancelled; that
    /// is not a failure.
    async fn wait(
        &self,
        executor: &dyn ExecutorBackend,
        execution: &Execution,
    ) -> Result<Option<RunResult>> {
        let timeout = execution.job.task().timeouts.execution;
        match tokio::time::timeout(timeout, executor.wait(execution.id)).await {
            Err(_) => Err(Error::ExecTimeout { timeout }),
            Ok(Err(BackendError::AlreadyCancelled)) => Ok(None),
            Ok(Err(error)) => Err(Error::internal(format!("waiting on execution: {error}"))),
            Ok(Ok(result)) => Ok(Some(result)),
        }
    }

    /// Writes `Failed` with the error, unless the record already went
    /// terminal (for example a cancel won the race).
    async fn handle_failure(&self, execution: &Execution, error: &Error) {
        tracing::warn!(
            execution_id = %execution.id,
            job_id = %execution.job_id,
            %error,
            "execution failed"
        );
        let topic = if matches!(error, Error::ExecTimeout { .. }) {
            topics::EXEC_TIMED_OUT
        } else {
            topics::EXEC_FAILED
        };
        let update = UpdateExecutionRequest::new(execution.id)
            .new_values(
                ExecutionUpdate::default().compute_state(
                    State::new(ComputeState::Failed).with_message(error.to_string()),
                ),
            )
            .with_event(Event::new(topic).with_error(error));
        match self.store.update_execution(update).await {
            Ok(_) | Err(Error::ExecutionAlreadyTerminal { .. }) => {}
            Err(update_error) => {
                tracing::error!(
                    execution_id = %execution.id,
                    error = %update_error,
                    "failed to record execution failure"
                );
            }
        }
    }
}
