//! The evaluation broker.
//!
//! Orders evaluations by (priority desc, create time asc) within each job
//! type, delivers at most one concurrent evaluation per job, and re-delivers
//! unacknowledged work.
//!
//! ## State
//!
//! - A per-type ready queue, priority-ordered. ULID evaluation IDs encode
//!   creation time, so the (create time, ID) tie-break is a single ID
//!   comparison.
//! - A per-job pending queue (FIFO); only one evaluation per job is ever
//!   visible in the ready/delayed/inflight structures, the rest wait here.
//! - A delayed set ordered by `wait_until`.
//! - An inflight table mapping evaluation ID to receipt handle, nack
//!   deadline and delivery count.
//!
//! ## Delivery semantics
//!
//! At-least-once, driven by explicit acks. A delivery that is not acked
//! within the visibility timeout is treated as nacked by the janitor and
//! re-delivered under a fresh receipt handle after the configured retry
//! delay; an explicit [`EvaluationBroker::nack`] re-readies immediately.
//! When the delivery count exceeds the budget the evaluation is failed with
//! reason `delivery-exceeded`.
//!
//! The broker is in-memory; on process restart it is reconciled from the
//! orchestrator's pending evaluations via [`EvaluationBroker::restore`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use flotilla_core::error::{Error, Result};
use flotilla_core::evaluation::{EvalStatus, Evaluation};
use flotilla_core::id::{EvalId, JobId};
use flotilla_core::job::JobType;

use crate::config::BrokerConfig;
use crate::metrics::BrokerMetrics;

/// Status reason recorded when an evaluation exhausts its delivery budget.
pub const REASON_DELIVERY_EXCEEDED: &str = "delivery-exceeded";

/// A delivered evaluation plus the receipt handle that acknowledges it.
pub type Delivery = (Evaluation, String);

/// Entry in a ready queue; ordered by (priority desc, ID asc).
#[derive(Debug)]
struct ReadyEntry {
    priority: i64,
    eval_id: EvalId,
    evaluation: Evaluation,
}

impl ReadyEntry {
    fn new(evaluation: Evaluation) -> Self {
        Self {
            priority: evaluation.priority,
            eval_id: evaluation.id,
            evaluation,
        }
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.eval_id == other.eval_id
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: greatest entry pops first. Higher priority wins; within
        // a priority the smaller (older) ULID wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.eval_id.cmp(&self.eval_id))
    }
}

#[derive(Debug)]
struct InflightEntry {
    evaluation: Evaluation,
    receipt: String,
    nack_deadline: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: HashMap<JobType, BinaryHeap<ReadyEntry>>,
    pending: HashMap<JobId, VecDeque<Evaluation>>,
    active_by_job: HashMap<JobId, EvalId>,
    delayed: BTreeMap<(DateTime<Utc>, EvalId), Evaluation>,
    inflight: HashMap<EvalId, InflightEntry>,
    tracked: HashSet<EvalId>,
    deferred: HashMap<EvalId, Evaluation>,
    failed: HashMap<EvalId, Evaluation>,
    delivery_counts: HashMap<EvalId, u32>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<BrokerState>,
    signals: HashMap<JobType, Notify>,
    config: BrokerConfig,
    metrics: BrokerMetrics,
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("evaluation broker lock poisoned")
}

/// Priority queue of evaluations with per-job serialisation and visibility
/// timeouts.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EvaluationBroker {
    shared: Arc<Shared>,
}

impl EvaluationBroker {
    /// Creates a broker with the given configuration.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let signals = JobType::ALL
            .into_iter()
            .map(|t| (t, Notify::new()))
            .collect();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                signals,
                config,
                metrics: BrokerMetrics::new(),
            }),
        }
    }

    /// Spawns the janitor task, which promotes delayed evaluations and
    /// re-delivers expired inflight ones until the token is cancelled.
    pub fn start_janitor(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        let interval = broker.shared.config.janitor_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        if let Err(error) = broker.tick(Utc::now()) {
                            tracing::error!(%error, "broker janitor tick failed");
                        }
                    }
                }
            }
        })
    }

    /// Adds an evaluation to the broker.
    ///
    /// - Already present by ID: no-op
    /// - Another evaluation of the same job is active: parked in that job's
    ///   pending queue
    /// - `wait_until` in the future: parked in the delayed set
    /// - Otherwise: visible to dequeue immediately
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn enqueue(&self, evaluation: Evaluation) -> Result<()> {
        let signal = {
            let mut state = self.shared.state.lock().map_err(poison_err)?;
            self.enqueue_locked(&mut state, evaluation)
        };
        if let Some(job_type) = signal {
            self.signal(job_type);
        }
        Ok(())
    }

    /// Enqueues many evaluations, optionally tagged with the receipt handle
    /// they were delivered under.
    ///
    /// An entry whose receipt matches the current inflight delivery of the
    /// same evaluation ID is deferred until that delivery is acked, then
    /// re-enqueued — "make sure we re-run after the current run completes."
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn enqueue_all(
        &self,
        evaluations: impl IntoIterator<Item = (Evaluation, Option<String>)>,
    ) -> Result<()> {
        let mut signals = Vec::new();
        {
            let mut state = self.shared.state.lock().map_err(poison_err)?;
            for (evaluation, receipt) in evaluations {
                let matches_inflight = receipt.as_ref().is_some_and(|r| {
                    state
                        .inflight
                        .get(&evaluation.id)
                        .is_some_and(|entry| &entry.receipt == r)
                });
                if matches_inflight {
                    state.deferred.insert(evaluation.id, evaluation);
                } else if let Some(job_type) = self.enqueue_locked(&mut state, evaluation) {
                    signals.push(job_type);
                }
            }
        }
        for job_type in signals {
            self.signal(job_type);
        }
        Ok(())
    }

    /// Re-enqueues pending evaluations at boot, reconciling broker state
    /// from the orchestrator's evaluation set.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn restore(&self, evaluations: impl IntoIterator<Item = Evaluation>) -> Result<()> {
        self.enqueue_all(evaluations.into_iter().map(|e| (e, None)))
    }

    /// Blocks up to `timeout` for the highest-priority ready evaluation in
    /// any of the requested types.
    ///
    /// On delivery a fresh receipt handle is generated and the evaluation
    /// becomes inflight with a nack deadline of now + visibility timeout.
    /// Returns `None` on timeout or shutdown.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub async fn dequeue(&self, types: &[JobType], timeout: Duration) -> Result<Option<Delivery>> {
        if types.is_empty() {
            return Ok(None);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wake-ups before checking so an enqueue between
            // the check and the await is not lost.
            let notified: Vec<_> = types
                .iter()
                .map(|t| {
                    let notify = &self.shared.signals[t];
                    let mut fut = Box::pin(notify.notified());
                    fut.as_mut().enable();
                    fut
                })
                .collect();

            {
                let mut state = self.shared.state.lock().map_err(poison_err)?;
                if state.shutdown {
                    return Ok(None);
                }
                if let Some(delivery) = self.try_deliver(&mut state, types) {
                    return Ok(Some(delivery));
                }
            }

            let any_signal = futures::future::select_all(notified);
            tokio::select! {
                _ = any_signal => {}
                () = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    /// Returns the receipt handle of an inflight evaluation, if any.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn inflight(&self, eval_id: &EvalId) -> Result<Option<String>> {
        let state = self.shared.state.lock().map_err(poison_err)?;
        Ok(state.inflight.get(eval_id).map(|e| e.receipt.clone()))
    }

    /// Returns how many times an inflight evaluation has been delivered.
    ///
    /// Workers use this to scale their retry backoff.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn inflight_delivery_count(&self, eval_id: &EvalId) -> Result<Option<u32>> {
        let state = self.shared.state.lock().map_err(poison_err)?;
        Ok(state.inflight.get(eval_id).map(|e| e.delivery_count))
    }

    /// Resets the nack deadline of an inflight delivery.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownEvaluation`] if the broker has never seen the ID
    /// - [`Error::NotInflight`] if the evaluation is not currently delivered
    /// - [`Error::WrongReceipt`] if the handle is stale
    pub fn inflight_extend(&self, eval_id: &EvalId, receipt: &str) -> Result<()> {
        let mut state = self.shared.state.lock().map_err(poison_err)?;
        let visibility = self.shared.config.visibility_timeout;
        let entry = Self::inflight_entry(&mut state, eval_id, receipt)?;
        entry.nack_deadline = Utc::now()
            + chrono::Duration::from_std(visibility)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Ok(())
    }

    /// Acknowledges a successful delivery, removing the evaluation from the
    /// broker and promoting the job's next pending evaluation if any.
    ///
    /// # Errors
    ///
    /// Same conditions as [`EvaluationBroker::inflight_extend`].
    pub fn ack(&self, eval_id: &EvalId, receipt: &str) -> Result<()> {
        let signal = {
            let mut state = self.shared.state.lock().map_err(poison_err)?;
            Self::inflight_entry(&mut state, eval_id, receipt)?;

            let entry = state
                .inflight
                .remove(eval_id)
                .expect("inflight presence checked above");
            let job_id = entry.evaluation.job_id;
            state.tracked.remove(eval_id);
            state.delivery_counts.remove(eval_id);
            state.active_by_job.remove(&job_id);
            self.shared.metrics.acked();

            // A deferred re-enqueue of the same ID takes the job slot first;
            // otherwise the oldest parked evaluation is promoted.
            if let Some(deferred) = state.deferred.remove(eval_id) {
                self.enqueue_locked(&mut state, deferred)
            } else {
                self.promote_next_pending(&mut state, &job_id)
            }
        };
        if let Some(job_type) = signal {
            self.signal(job_type);
        }
        Ok(())
    }

    /// Negatively acknowledges a delivery, returning the evaluation to the
    /// ready queue immediately.
    ///
    /// # Errors
    ///
    /// Same conditions as [`EvaluationBroker::inflight_extend`], plus
    /// [`Error::MaxDeliveryExceeded`] when the delivery budget is exhausted
    /// (the evaluation is failed, not re-readied).
    pub fn nack(&self, eval_id: &EvalId, receipt: &str) -> Result<()> {
        let (signal, exceeded) = {
            let mut state = self.shared.state.lock().map_err(poison_err)?;
            Self::inflight_entry(&mut state, eval_id, receipt)?;

            let entry = state
                .inflight
                .remove(eval_id)
                .expect("inflight presence checked above");
            self.shared.metrics.nacked();

            if entry.delivery_count > self.shared.config.max_retries {
                let deliveries = entry.delivery_count;
                let signal = self.fail_delivery(&mut state, entry.evaluation);
                (signal, Some(deliveries))
            } else {
                let job_type = entry.evaluation.job_type;
                state
                    .ready
                    .entry(job_type)
                    .or_default()
                    .push(ReadyEntry::new(entry.evaluation));
                (Some(job_type), None)
            }
        };
        if let Some(job_type) = signal {
            self.signal(job_type);
        }
        if let Some(deliveries) = exceeded {
            return Err(Error::MaxDeliveryExceeded {
                id: *eval_id,
                deliveries,
            });
        }
        Ok(())
    }

    /// Runs one janitor pass: promotes due delayed evaluations and treats
    /// expired inflight deliveries as nacks with a bumped delivery count.
    ///
    /// Public so tests can drive time deterministically.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let mut signals = Vec::new();
        {
            let mut state = self.shared.state.lock().map_err(poison_err)?;

            // Promote delayed evaluations whose wait has elapsed.
            let due: Vec<_> = state
                .delayed
                .keys()
                .take_while(|(wake, _)| *wake <= now)
                .copied()
                .collect();
            for key in due {
                if let Some(evaluation) = state.delayed.remove(&key) {
                    let job_type = evaluation.job_type;
                    state
                        .ready
                        .entry(job_type)
                        .or_default()
                        .push(ReadyEntry::new(evaluation));
                    signals.push(job_type);
                }
            }

            // Expired inflight deliveries go back out after the retry delay.
            let expired: Vec<EvalId> = state
                .inflight
                .iter()
                .filter(|(_, entry)| entry.nack_deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for eval_id in expired {
                let entry = state
                    .inflight
                    .remove(&eval_id)
                    .expect("expired id collected above");
                self.shared.metrics.expired();
                tracing::debug!(
                    eval_id = %eval_id,
                    delivery_count = entry.delivery_count,
                    "inflight evaluation expired, re-delivering"
                );

                if entry.delivery_count > self.shared.config.max_retries {
                    if let Some(job_type) = self.fail_delivery(&mut state, entry.evaluation) {
                        signals.push(job_type);
                    }
                } else {
                    let delay = if entry.delivery_count <= 1 {
                        self.shared.config.initial_retry_delay
                    } else {
                        self.shared.config.subsequent_retry_delay
                    };
                    if delay.is_zero() {
                        let job_type = entry.evaluation.job_type;
                        state
                            .ready
                            .entry(job_type)
                            .or_default()
                            .push(ReadyEntry::new(entry.evaluation));
                        signals.push(job_type);
                    } else {
                        let wake = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(1));
                        state
                            .delayed
                            .insert((wake, entry.evaluation.id), entry.evaluation);
                    }
                }
            }

            self.shared.metrics.depths(
                state.ready.values().map(BinaryHeap::len).sum(),
                state.inflight.len(),
                state.delayed.len(),
            );
        }
        for job_type in signals {
            self.signal(job_type);
        }
        Ok(())
    }

    /// Returns a failed evaluation (delivery budget exhausted), if any.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn failed(&self, eval_id: &EvalId) -> Result<Option<Evaluation>> {
        let state = self.shared.state.lock().map_err(poison_err)?;
        Ok(state.failed.get(eval_id).cloned())
    }

    /// Stops delivery and wakes every blocked dequeuer.
    ///
    /// Part of the drain sequence: stop dequeue, wait for inflight acks,
    /// close store subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().map_err(poison_err)?;
            state.shutdown = true;
        }
        for notify in self.shared.signals.values() {
            notify.notify_waiters();
        }
        Ok(())
    }

    /// Returns the number of inflight deliveries, for drain monitoring.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the broker lock is poisoned.
    pub fn inflight_count(&self) -> Result<usize> {
        let state = self.shared.state.lock().map_err(poison_err)?;
        Ok(state.inflight.len())
    }

    fn signal(&self, job_type: JobType) {
        self.shared.signals[&job_type].notify_waiters();
    }

    /// Enqueue under the lock; returns the type to signal, if the evaluation
    /// became ready.
    fn enqueue_locked(
        &self,
        state: &mut BrokerState,
        evaluation: Evaluation,
    ) -> Option<JobType> {
        if state.tracked.contains(&evaluation.id) {
            return None;
        }
        state.tracked.insert(evaluation.id);
        state.delivery_counts.entry(evaluation.id).or_insert(0);
        self.shared.metrics.enqueued();

        if state.active_by_job.contains_key(&evaluation.job_id) {
            state
                .pending
                .entry(evaluation.job_id)
                .or_default()
                .push_back(evaluation);
            return None;
        }

        state.active_by_job.insert(evaluation.job_id, evaluation.id);
        let now = Utc::now();
        if let Some(wait_until) = evaluation.wait_until {
            if wait_until > now {
                state.delayed.insert((wait_until, evaluation.id), evaluation);
                return None;
            }
        }
        let job_type = evaluation.job_type;
        state
            .ready
            .entry(job_type)
            .or_default()
            .push(ReadyEntry::new(evaluation));
        Some(job_type)
    }

    /// Pops the best ready evaluation across the requested types and marks
    /// it inflight.
    fn try_deliver(&self, state: &mut BrokerState, types: &[JobType]) -> Option<Delivery> {
        let best_type = types
            .iter()
            .filter_map(|t| state.ready.get(t).and_then(BinaryHeap::peek).map(|e| (*t, e)))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(t, _)| t)?;

        let entry = state.ready.get_mut(&best_type)?.pop()?;
        let receipt = Ulid::new().to_string();
        let delivery_count = state
            .delivery_counts
            .entry(entry.eval_id)
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let delivery_count = *delivery_count;

        let visibility = chrono::Duration::from_std(self.shared.config.visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        state.inflight.insert(
            entry.eval_id,
            InflightEntry {
                evaluation: entry.evaluation.clone(),
                receipt: receipt.clone(),
                nack_deadline: Utc::now() + visibility,
                delivery_count,
            },
        );
        self.shared.metrics.delivered();
        Some((entry.evaluation, receipt))
    }

    /// Looks up an inflight entry, distinguishing unknown, not-inflight and
    /// stale-receipt failures.
    fn inflight_entry<'a>(
        state: &'a mut BrokerState,
        eval_id: &EvalId,
        receipt: &str,
    ) -> Result<&'a mut InflightEntry> {
        if !state.tracked.contains(eval_id) && !state.inflight.contains_key(eval_id) {
            return Err(Error::UnknownEvaluation { id: *eval_id });
        }
        let Some(entry) = state.inflight.get_mut(eval_id) else {
            return Err(Error::NotInflight { id: *eval_id });
        };
        if entry.receipt != receipt {
            return Err(Error::WrongReceipt { id: *eval_id });
        }
        Ok(entry)
    }

    /// Fails an evaluation that exhausted its delivery budget and frees its
    /// job slot.
    fn fail_delivery(
        &self,
        state: &mut BrokerState,
        mut evaluation: Evaluation,
    ) -> Option<JobType> {
        tracing::warn!(
            eval_id = %evaluation.id,
            job_id = %evaluation.job_id,
            "evaluation exceeded delivery budget, failing"
        );
        let eval_id = evaluation.id;
        let job_id = evaluation.job_id;
        evaluation.status = EvalStatus::Failed;
        evaluation.status_description = Some(REASON_DELIVERY_EXCEEDED.to_string());
        state.failed.insert(eval_id, evaluation);
        state.tracked.remove(&eval_id);
        state.delivery_counts.remove(&eval_id);
        state.active_by_job.remove(&job_id);
        state.deferred.remove(&eval_id);
        self.shared.metrics.failed();
        self.promote_next_pending(state, &job_id)
    }

    /// Promotes the oldest parked evaluation of a job into the broker.
    fn promote_next_pending(&self, state: &mut BrokerState, job_id: &JobId) -> Option<JobType> {
        let next = {
            let queue = state.pending.get_mut(job_id)?;
            let next = queue.pop_front();
            if queue.is_empty() {
                state.pending.remove(job_id);
            }
            next?
        };
        // Re-run the placement logic; the promoted evaluation was already
        // tracked, so untrack it first.
        state.tracked.remove(&next.id);
        self.enqueue_locked(state, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::evaluation::trigger;

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            visibility_timeout: Duration::from_secs(60),
            initial_retry_delay: Duration::ZERO,
            subsequent_retry_delay: Duration::ZERO,
            max_retries: 3,
            janitor_interval: Duration::from_millis(50),
        }
    }

    fn eval(job_id: JobId, priority: i64) -> Evaluation {
        Evaluation::new(job_id, "default", JobType::Batch, trigger::JOB_REGISTER)
            .with_priority(priority)
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_age() -> Result<()> {
        let broker = EvaluationBroker::new(test_config());

        let low = eval(JobId::generate(), 1);
        let old_high = eval(JobId::generate(), 10);
        std::thread::sleep(Duration::from_millis(2));
        let new_high = eval(JobId::generate(), 10);

        broker.enqueue(low.clone())?;
        broker.enqueue(new_high.clone())?;
        broker.enqueue(old_high.clone())?;

        let (first, _) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("first delivery");
        let (second, _) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("second delivery");
        let (third, _) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("third delivery");

        assert_eq!(first.id, old_high.id);
        assert_eq!(second.id, new_high.id);
        assert_eq!(third.id, low.id);

        Ok(())
    }

    #[tokio::test]
    async fn one_inflight_per_job() -> Result<()> {
        let broker = EvaluationBroker::new(test_config());
        let job_id = JobId::generate();

        let first = eval(job_id, 0);
        let second = eval(job_id, 0);
        broker.enqueue(first.clone())?;
        broker.enqueue(second.clone())?;

        let (delivered, receipt) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("delivery");
        assert_eq!(delivered.id, first.id);

        // The second evaluation is parked until the first is acked.
        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(50))
            .await?
            .is_none());

        broker.ack(&first.id, &receipt)?;
        let (promoted, _) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("promoted delivery");
        assert_eq!(promoted.id, second.id);

        Ok(())
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_by_id() -> Result<()> {
        let broker = EvaluationBroker::new(test_config());
        let evaluation = eval(JobId::generate(), 0);

        broker.enqueue(evaluation.clone())?;
        broker.enqueue(evaluation.clone())?;

        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(50))
            .await?
            .is_some());
        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(50))
            .await?
            .is_none());

        Ok(())
    }

    #[tokio::test]
    async fn nack_redelivers_with_fresh_receipt() -> Result<()> {
        let broker = EvaluationBroker::new(test_config());
        let evaluation = eval(JobId::generate(), 0);
        broker.enqueue(evaluation.clone())?;

        let (_, first_receipt) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("delivery");
        assert_eq!(broker.inflight(&evaluation.id)?, Some(first_receipt.clone()));
        broker.nack(&evaluation.id, &first_receipt)?;
        assert_eq!(broker.inflight(&evaluation.id)?, None);

        let (_, second_receipt) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("redelivery");
        assert_ne!(first_receipt, second_receipt);

        // The stale receipt is rejected.
        let err = broker.ack(&evaluation.id, &first_receipt).unwrap_err();
        assert!(matches!(err, Error::WrongReceipt { .. }));

        broker.ack(&evaluation.id, &second_receipt)?;
        Ok(())
    }

    #[tokio::test]
    async fn visibility_timeout_redelivers() -> Result<()> {
        let mut config = test_config();
        config.visibility_timeout = Duration::from_millis(10);
        let broker = EvaluationBroker::new(config);

        let evaluation = eval(JobId::generate(), 0);
        broker.enqueue(evaluation.clone())?;

        let (_, receipt) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("delivery");

        // Janitor pass after the deadline treats the delivery as nacked.
        broker.tick(Utc::now() + chrono::Duration::seconds(1))?;

        let (_, fresh) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("redelivery");
        assert_ne!(receipt, fresh);
        assert!(matches!(
            broker.nack(&evaluation.id, &receipt).unwrap_err(),
            Error::WrongReceipt { .. }
        ));

        Ok(())
    }

    #[tokio::test]
    async fn inflight_extend_outlives_the_original_deadline() -> Result<()> {
        let mut config = test_config();
        config.visibility_timeout = Duration::from_millis(50);
        let broker = EvaluationBroker::new(config);

        let evaluation = eval(JobId::generate(), 0);
        broker.enqueue(evaluation.clone())?;
        let (_, receipt) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("delivery");

        // Let the original deadline pass, then extend.
        tokio::time::sleep(Duration::from_millis(80)).await;
        broker.inflight_extend(&evaluation.id, &receipt)?;
        broker.tick(Utc::now())?;
        assert!(
            broker.inflight(&evaluation.id)?.is_some(),
            "extension keeps the delivery inflight"
        );

        // A janitor pass far in the future still expires it.
        broker.tick(Utc::now() + chrono::Duration::seconds(10))?;
        assert!(broker.inflight(&evaluation.id)?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn delivery_budget_exhaustion_fails_evaluation() -> Result<()> {
        let mut config = test_config();
        config.visibility_timeout = Duration::from_millis(1);
        config.max_retries = 2;
        let broker = EvaluationBroker::new(config);

        let evaluation = eval(JobId::generate(), 0);
        broker.enqueue(evaluation.clone())?;

        // Each cycle: deliver, then expire via the janitor.
        for _ in 0..4 {
            if broker
                .dequeue(&[JobType::Batch], Duration::from_millis(50))
                .await?
                .is_none()
            {
                break;
            }
            broker.tick(Utc::now() + chrono::Duration::seconds(5))?;
        }

        let failed = broker.failed(&evaluation.id)?.expect("failed evaluation");
        assert_eq!(failed.status, EvalStatus::Failed);
        assert_eq!(
            failed.status_description.as_deref(),
            Some(REASON_DELIVERY_EXCEEDED)
        );

        Ok(())
    }

    #[tokio::test]
    async fn wait_until_defers_delivery() -> Result<()> {
        let broker = EvaluationBroker::new(test_config());
        let evaluation = eval(JobId::generate(), 0)
            .with_wait_until(Utc::now() + chrono::Duration::seconds(60));
        broker.enqueue(evaluation.clone())?;

        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(50))
            .await?
            .is_none());

        // Janitor promotes it once the wait elapses.
        broker.tick(Utc::now() + chrono::Duration::seconds(120))?;
        let delivered = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?;
        assert!(delivered.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn deferred_reenqueue_waits_for_ack() -> Result<()> {
        let broker = EvaluationBroker::new(test_config());
        let evaluation = eval(JobId::generate(), 0);
        broker.enqueue(evaluation.clone())?;

        let (delivered, receipt) = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?
            .expect("delivery");

        // Re-enqueue with the matching receipt: deferred until ack.
        broker.enqueue_all([(delivered.clone(), Some(receipt.clone()))])?;
        assert!(broker
            .dequeue(&[JobType::Batch], Duration::from_millis(50))
            .await?
            .is_none());

        broker.ack(&evaluation.id, &receipt)?;
        let redelivered = broker
            .dequeue(&[JobType::Batch], Duration::from_millis(100))
            .await?;
        assert!(redelivered.is_some(), "deferred evaluation re-runs after ack");

        Ok(())
    }

    #[tokio::test]
    async fn dequeue_filters_by_type() -> Result<()> {
        let broker = EvaluationBroker::new(test_config());
        let batch = eval(JobId::generate(), 0);
        let daemon = Evaluation::new(
            JobId::generate(),
            "default",
            JobType::Daemon,
            trigger::JOB_REGISTER,
        );
        broker.enqueue(batch)?;
        broker.enqueue(daemon.clone())?;

        let (delivered, _) = broker
            .dequeue(&[JobType::Daemon], Duration::from_millis(100))
            .await?
            .expect("daemon delivery");
        assert_eq!(delivered.id, daemon.id);

        Ok(())
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_dequeuers() -> Result<()> {
        let broker = EvaluationBroker::new(test_config());
        let waiter = broker.clone();
        let handle = tokio::spawn(async move {
            waiter.dequeue(&[JobType::Batch], Duration::from_secs(30)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.shutdown()?;

        let delivered = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dequeuer should wake")
            .expect("task join")?;
        assert!(delivered.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn ack_with_unknown_id_is_rejected() {
        let broker = EvaluationBroker::new(test_config());
        let err = broker.ack(&EvalId::generate(), "receipt").unwrap_err();
        assert!(matches!(err, Error::UnknownEvaluation { .. }));
    }
}
