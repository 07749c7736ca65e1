//! The compute node's watch loop and execution state machine.
//!
//! A node follows the store's change feed and reconciles every execution
//! assigned to it. Reconciliation is state-based, not edge-triggered: each
//! change is judged by the full `(compute_state, desired_state)` pair, so
//! at-least-once delivery and the node's own writes echoing back are
//! harmless.
//!
//! Every transition is a compare-and-set store update expecting the prior
//! state; when two deliveries race, exactly one wins and the loser's
//! condition failure is dropped.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use flotilla_core::error::{Error, Result};
use flotilla_core::event::{topics, Event};
use flotilla_core::execution::{
    ComputeState, DesiredState, Execution, State, REASON_CAPACITY_UNAVAILABLE,
};
use flotilla_core::id::NodeId;
use flotilla_core::store::{
    ExecutionStore, ExecutionUpdate, UpdateCondition, UpdateExecutionRequest,
};

use crate::bidder::{BidRequest, BidResponse, BidStrategy};
use crate::capacity::CapacityTracker;
use crate::runner::ExecutionRunner;

/// One compute node: watch loop, bidder and runner dispatch.
pub struct ComputeNode {
    node_id: NodeId,
    store: Arc<dyn ExecutionStore>,
    runner: Arc<ExecutionRunner>,
    bid_strategy: Arc<dyn BidStrategy>,
    capacity: Arc<CapacityTracker>,
}

impl ComputeNode {
    /// Creates a node.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn ExecutionStore>,
        runner: Arc<ExecutionRunner>,
        bid_strategy: Arc<dyn BidStrategy>,
        capacity: Arc<CapacityTracker>,
    ) -> Self {
        Self {
            node_id,
            store,
            runner,
            bid_strategy,
            capacity,
        }
    }

    /// Follows the change feed from `from_seq` until the token is
    /// cancelled, reconciling every execution assigned to this node.
    ///
    /// # Errors
    ///
    /// Propagates store watch failures; reconciliation failures are logged
    /// and retried on the next change.
    pub async fn run(&self, from_seq: u64, token: CancellationToken) -> Result<()> {
        let mut watch = self.store.watch(from_seq).await?;
        tracing::info!(node_id = %self.node_id, from_seq, "compute node watching");
        loop {
            let change = tokio::select! {
                () = token.cancelled() => return Ok(()),
                change = watch.next() => change?,
            };
            if change.execution.node_id != self.node_id {
                continue;
            }
            if let Err(error) = self.reconcile(change.execution).await {
                tracing::warn!(
                    node_id = %self.node_id,
                    %error,
                    "reconciliation failed; will retry on next change"
                );
            }
        }
    }

    /// Reconciles one execution against its desired state.
    ///
    /// Public so tests can drive the state machine without a feed.
    ///
    /// # Errors
    ///
    /// Propagates store failures other than lost CAS races.
    pub async fn reconcile(&self, execution: Execution) -> Result<()> {
        let compute = execution.compute_state.state;
        let desired = execution.desired_state.state;

        if compute.is_terminal() {
            // Free anything a bid reserved; runners release on their own
            // exit paths too, so this is an idempotent backstop.
            self.capacity.release(&execution.id);
            return Ok(());
        }

        match (compute, desired) {
            (ComputeState::New | ComputeState::AskForBid, DesiredState::Stopped) => {
                self.transition(
                    &execution,
                    &[compute],
                    State::new(ComputeState::Cancelled),
                    Event::new(topics::EXEC_CANCELLED),
                )
                .await
                .map(|_| ())
            }
            (ComputeState::New, _) => self.bid(&execution).await,
            (ComputeState::AskForBidAccepted, DesiredState::Running) => {
                self.start_accepted(&execution).await
            }
            (ComputeState::AskForBidAccepted, DesiredState::Stopped) => {
                self.capacity.release(&execution.id);
                self.transition(
                    &execution,
                    &[ComputeState::AskForBidAccepted],
                    State::new(ComputeState::BidRejected).with_message(
                        execution
                            .desired_state
                            .message
                            .clone()
                            .unwrap_or_else(|| "bid rejected".to_string()),
                    ),
                    Event::new(topics::EXEC_BID_REJECTED),
                )
                .await
                .map(|_| ())
            }
            (
                ComputeState::BidAccepted | ComputeState::Running | ComputeState::Publishing,
                DesiredState::Stopped,
            ) => self.cancel(&execution).await,
            // Mid-handshake or already running as desired: nothing to do.
            _ => Ok(()),
        }
    }

    /// Acknowledges a new execution and runs the bid strategies.
    async fn bid(&self, execution: &Execution) -> Result<()> {
        // Acknowledge first; the ask is now visibly being considered.
        let Some(execution) = self
            .transition(
                execution,
                &[ComputeState::New],
                State::new(ComputeState::AskForBid),
                Event::new(topics::EXEC_BID_OFFERED)
                    .with_message(format!("node {} considering bid", self.node_id)),
            )
            .await?
        else {
            return Ok(());
        };

        let request = BidRequest {
            job: execution.job.clone(),
        };
        let response = match self.bid_strategy.should_bid(&request) {
            Ok(response) => response,
            Err(error) => BidResponse::reject(format!("bid strategy failed: {error}")),
        };

        if !response.should_bid {
            return self
                .transition(
                    &execution,
                    &[ComputeState::AskForBid],
                    State::new(ComputeState::AskForBidRejected)
                        .with_message(response.reason.clone()),
                    Event::new(topics::EXEC_BID_DECLINED).with_message(response.reason),
                )
                .await
                .map(|_| ());
        }

        // Strategy said yes; capacity has the last word.
        let resources = execution.total_allocated_resources();
        if !self.capacity.try_reserve(execution.id, resources) {
            return self
                .transition(
                    &execution,
                    &[ComputeState::AskForBid],
                    State::new(ComputeState::AskForBidRejected)
                        .with_message(REASON_CAPACITY_UNAVAILABLE.to_string()),
                    Event::new(topics::EXEC_BID_DECLINED)
                        .with_message(REASON_CAPACITY_UNAVAILABLE),
                )
                .await
                .map(|_| ());
        }

        self.transition(
            &execution,
            &[ComputeState::AskForBid],
            State::new(ComputeState::AskForBidAccepted),
            Event::new(topics::EXEC_BID_OFFERED).with_message("bid offered"),
        )
        .await
        .map(|_| ())
    }

    /// Moves an approved bid to `BidAccepted` and spawns the runner.
    async fn start_accepted(&self, execution: &Execution) -> Result<()> {
        let updated = self
            .transition(
                execution,
                &[ComputeState::AskForBidAccepted],
                State::new(ComputeState::BidAccepted),
                Event::new(topics::EXEC_BID_ACCEPTED),
            )
            .await?;
        // A lost race means another delivery of the same change got here
        // first; only the winner spawns the runner.
        if let Some(updated) = updated {
            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move {
                runner.run(updated).await;
            });
        }
        Ok(())
    }

    /// Stops a committed or running execution: explicit backend cancel,
    /// then the `Cancelled` transition.
    async fn cancel(&self, execution: &Execution) -> Result<()> {
        if let Err(error) = self.runner.cancel(execution).await {
            tracing::warn!(
                execution_id = %execution.id,
                %error,
                "backend cancel failed; recording cancellation anyway"
            );
        }
        self.capacity.release(&execution.id);
        self.transition(
            execution,
            &[
                ComputeState::BidAccepted,
                ComputeState::Running,
                ComputeState::Publishing,
            ],
            State::new(ComputeState::Cancelled).with_message(
                execution
                    .desired_state
                    .message
                    .clone()
                    .unwrap_or_else(|| "stop requested".to_string()),
            ),
            Event::new(topics::EXEC_CANCELLED),
        )
        .await
        .map(|_| ())
    }

    /// One compare-and-set transition. Returns `None` when the record moved
    /// on and the race was lost; that is never an error.
    async fn transition(
        &self,
        execution: &Execution,
        expected: &[ComputeState],
        to: State<ComputeState>,
        event: Event,
    ) -> Result<Option<Execution>> {
        let result = self
            .store
            .update_execution(
                UpdateExecutionRequest::new(execution.id)
                    .condition(UpdateCondition::default().expect_states(expected.iter().copied()))
                    .new_values(ExecutionUpdate::default().compute_state(to))
                    .with_event(event),
            )
            .await;
        match result {
            Ok(updated) => Ok(Some(updated)),
            Err(Error::ConditionFailed { .. } | Error::ExecutionAlreadyTerminal { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }
}
