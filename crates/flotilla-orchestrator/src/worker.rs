//! The worker loop: broker to scheduler to planner, with ack/nack.
//!
//! Workers are long-lived consumers. Each iteration dequeues one evaluation,
//! builds the world snapshot, runs the matching scheduler, applies the plan
//! and acks. Retriable failures nack after an exponential backoff scaled by
//! the delivery count; permanent failures mark the evaluation failed and
//! ack so it never redelivers.
//!
//! The broker's per-job serialisation means any number of workers can run
//! concurrently without two of them scheduling the same job at once.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use flotilla_core::error::Result;
use flotilla_core::evaluation::{EvalStatus, Evaluation};

use crate::broker::EvaluationBroker;
use crate::config::SchedulerConfig;
use crate::metrics::EvalRecorder;
use crate::planner::Planner;
use crate::scheduler::{SchedulerProvider, WorldBuilder};
use crate::state::EvaluationSet;

/// One evaluation-processing loop.
pub struct Worker {
    broker: EvaluationBroker,
    provider: Arc<SchedulerProvider>,
    planner: Arc<Planner>,
    world: Arc<WorldBuilder>,
    evaluations: Arc<EvaluationSet>,
    config: SchedulerConfig,
}

impl Worker {
    /// Creates a worker over the orchestrator's components.
    #[must_use]
    pub fn new(
        broker: EvaluationBroker,
        provider: Arc<SchedulerProvider>,
        planner: Arc<Planner>,
        world: Arc<WorldBuilder>,
        evaluations: Arc<EvaluationSet>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            broker,
            provider,
            planner,
            world,
            evaluations,
            config,
        }
    }

    /// Runs until the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only when the broker itself is broken; evaluation
    /// failures are handled in the loop.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let types = self.provider.enabled_types();
        loop {
            let delivery = tokio::select! {
                () = token.cancelled() => return Ok(()),
                delivery = self.broker.dequeue(&types, self.config.dequeue_timeout) => delivery?,
            };
            let Some((evaluation, receipt)) = delivery else {
                continue;
            };
            self.process_delivery(&token, evaluation, &receipt).await;
        }
    }

    /// Processes one delivery end-to-end, including its ack or nack.
    async fn process_delivery(
        &self,
        token: &CancellationToken,
        evaluation: Evaluation,
        receipt: &str,
    ) {
        let recorder = EvalRecorder::start(evaluation.job_type);
        tracing::debug!(
            eval_id = %evaluation.id,
            job_id = %evaluation.job_id,
            triggered_by = %evaluation.triggered_by,
            "processing evaluation"
        );

        let outcome = tokio::select! {
            () = token.cancelled() => {
                // Cancellation mid-run: give the evaluation back.
                if let Err(error) = self.broker.nack(&evaluation.id, receipt) {
                    tracing::warn!(%error, eval_id = %evaluation.id, "nack on shutdown failed");
                }
                recorder.flush("cancelled");
                return;
            }
            result = self.schedule(&evaluation) => result,
        };

        match outcome {
            Ok(eval_failure) => {
                let status = if let Some(reason) = eval_failure {
                    if let Err(error) = self.evaluations.update_status(
                        &evaluation.id,
                        EvalStatus::Failed,
                        Some(reason),
                    ) {
                        tracing::warn!(%error, eval_id = %evaluation.id, "failed to record eval status");
                    }
                    "failed"
                } else {
                    if let Err(error) = self.evaluations.update_status(
                        &evaluation.id,
                        EvalStatus::Complete,
                        None,
                    ) {
                        tracing::warn!(%error, eval_id = %evaluation.id, "failed to record eval status");
                    }
                    "ack"
                };
                if let Err(error) = self.broker.ack(&evaluation.id, receipt) {
                    tracing::warn!(%error, eval_id = %evaluation.id, "ack failed");
                }
                recorder.flush(status);
            }
            Err(error) if error.is_retryable() => {
                let attempts = self
                    .broker
                    .inflight_delivery_count(&evaluation.id)
                    .ok()
                    .flatten()
                    .unwrap_or(1);
                if attempts <= self.config.worker_max_retries {
                    let backoff = self.backoff(attempts);
                    tracing::warn!(
                        %error,
                        eval_id = %evaluation.id,
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "retriable scheduling failure, nacking"
                    );
                    tokio::time::sleep(backoff).await;
                    if let Err(error) = self.broker.nack(&evaluation.id, receipt) {
                        tracing::warn!(%error, eval_id = %evaluation.id, "nack failed");
                    }
                    recorder.flush("nack");
                } else {
                    self.fail_and_ack(&evaluation, receipt, &error.to_string());
                    recorder.flush("failed");
                }
            }
            Err(error) => {
                self.fail_and_ack(&evaluation, receipt, &error.to_string());
                recorder.flush("failed");
            }
        }
    }

    /// Builds the world, runs the scheduler and applies the plan.
    ///
    /// Returns the plan's evaluation failure, if the scheduler surfaced one.
    async fn schedule(&self, evaluation: &Evaluation) -> Result<Option<String>> {
        let scheduler = self.provider.scheduler(evaluation.job_type)?;
        let world = self.world.build(evaluation).await?;
        let plan = scheduler.process(evaluation, &world)?;
        self.planner.process(&plan).await?;
        Ok(plan.eval_failure)
    }

    /// Marks the evaluation permanently failed and acks it away.
    fn fail_and_ack(&self, evaluation: &Evaluation, receipt: &str, reason: &str) {
        tracing::error!(
            eval_id = %evaluation.id,
            job_id = %evaluation.job_id,
            reason,
            "evaluation failed permanently"
        );
        if let Err(error) =
            self.evaluations
                .update_status(&evaluation.id, EvalStatus::Failed, Some(reason.to_string()))
        {
            tracing::warn!(%error, eval_id = %evaluation.id, "failed to record eval status");
        }
        if let Err(error) = self.broker.ack(&evaluation.id, receipt) {
            tracing::warn!(%error, eval_id = %evaluation.id, "ack failed");
        }
    }

    /// Exponential backoff with full jitter, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.as_millis() as u64;
        let cap = self.config.backoff_cap.as_millis() as u64;
        let exp = base.saturating_mul(1_u64 << attempt.saturating_sub(1).min(16));
        let ceiling = exp.min(cap).max(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Spawns and drains a set of workers.
pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<Result<()>>>,
    token: CancellationToken,
}

impl WorkerPool {
    /// Spawns `config.workers` workers sharing the given components.
    #[must_use]
    pub fn start(
        broker: EvaluationBroker,
        provider: Arc<SchedulerProvider>,
        planner: Arc<Planner>,
        world: Arc<WorldBuilder>,
        evaluations: Arc<EvaluationSet>,
        config: &SchedulerConfig,
        token: CancellationToken,
    ) -> Self {
        let mut handles = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker = Worker::new(
                broker.clone(),
                Arc::clone(&provider),
                Arc::clone(&planner),
                Arc::clone(&world),
                Arc::clone(&evaluations),
                config.clone(),
            );
            let worker_token = token.clone();
            handles.push(tokio::spawn(async move {
                tracing::debug!(worker = index, "worker started");
                worker.run(worker_token).await
            }));
        }
        Self { handles, token }
    }

    /// Cancels every worker and waits for the loops to exit.
    pub async fn drain(self) {
        self.token.cancel();
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::error!(%error, "worker exited with error"),
                Err(error) => tracing::error!(%error, "worker task panicked"),
            }
        }
    }
}
