//! Concurrency properties of the evaluation broker under competing workers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flotilla_core::error::Result;
use flotilla_core::evaluation::{trigger, Evaluation};
use flotilla_core::id::JobId;
use flotilla_core::job::JobType;
use flotilla_orchestrator::broker::EvaluationBroker;
use flotilla_orchestrator::config::BrokerConfig;

fn broker() -> EvaluationBroker {
    EvaluationBroker::new(BrokerConfig {
        visibility_timeout: Duration::from_secs(30),
        initial_retry_delay: Duration::ZERO,
        subsequent_retry_delay: Duration::ZERO,
        max_retries: 10,
        janitor_interval: Duration::from_millis(20),
    })
}

fn eval(job_id: JobId) -> Evaluation {
    Evaluation::new(job_id, "default", JobType::Batch, trigger::JOB_REGISTER)
}

/// At any instant, at most one evaluation per job is inflight, for any
/// interleaving of concurrent dequeuers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_inflight_per_job() -> Result<()> {
    const JOBS: usize = 5;
    const EVALS_PER_JOB: usize = 4;
    const WORKERS: usize = 4;

    let broker = broker();
    let jobs: Vec<JobId> = (0..JOBS).map(|_| JobId::generate()).collect();
    for job_id in &jobs {
        for _ in 0..EVALS_PER_JOB {
            broker.enqueue(eval(*job_id))?;
        }
    }

    // Jobs currently held by some worker; a second appearance is a
    // serialisation violation.
    let inflight_jobs: Arc<Mutex<HashSet<JobId>>> = Arc::new(Mutex::new(HashSet::new()));
    let violations = Arc::new(Mutex::new(Vec::<String>::new()));
    let processed = Arc::new(Mutex::new(0usize));

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let broker = broker.clone();
        let inflight_jobs = Arc::clone(&inflight_jobs);
        let violations = Arc::clone(&violations);
        let processed = Arc::clone(&processed);
        handles.push(tokio::spawn(async move {
            loop {
                {
                    let processed = processed.lock().unwrap();
                    if *processed >= JOBS * EVALS_PER_JOB {
                        return;
                    }
                }
                let Ok(Some((evaluation, receipt))) = broker
                    .dequeue(&[JobType::Batch], Duration::from_millis(50))
                    .await
                else {
                    continue;
                };

                {
                    let mut held = inflight_jobs.lock().unwrap();
                    if !held.insert(evaluation.job_id) {
                        violations.lock().unwrap().push(format!(
                            "worker {worker}: job {} already inflight elsewhere",
                            evaluation.job_id
                        ));
                    }
                }

                tokio::time::sleep(Duration::from_millis(2)).await;

                {
                    let mut held = inflight_jobs.lock().unwrap();
                    held.remove(&evaluation.job_id);
                }
                broker.ack(&evaluation.id, &receipt).expect("ack");
                *processed.lock().unwrap() += 1;
            }
        }));
    }

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("workers should finish")
            .expect("worker task");
    }

    let violations = violations.lock().unwrap();
    assert!(violations.is_empty(), "violations: {violations:?}");
    assert_eq!(*processed.lock().unwrap(), JOBS * EVALS_PER_JOB);

    Ok(())
}

/// Within one type, deliveries follow (priority desc, create time asc)
/// modulo per-job gating.
#[tokio::test]
async fn delivery_respects_priority_order_across_jobs() -> Result<()> {
    let broker = broker();

    let mut expected = Vec::new();
    for priority in [3_i64, 9, 1, 7, 5] {
        let evaluation = eval(JobId::generate()).with_priority(priority);
        expected.push((priority, evaluation.id));
        broker.enqueue(evaluation)?;
    }
    expected.sort_by(|a, b| b.0.cmp(&a.0));

    let mut delivered = Vec::new();
    while let Some((evaluation, receipt)) = broker
        .dequeue(&[JobType::Batch], Duration::from_millis(50))
        .await?
    {
        delivered.push((evaluation.priority, evaluation.id));
        broker.ack(&evaluation.id, &receipt)?;
    }

    assert_eq!(delivered, expected);
    Ok(())
}

/// The janitor's visibility-timeout redelivery keeps per-job serialisation
/// intact: the redelivered evaluation still blocks its job's queue.
#[tokio::test]
async fn redelivery_preserves_job_serialisation() -> Result<()> {
    let broker = EvaluationBroker::new(BrokerConfig {
        visibility_timeout: Duration::from_millis(20),
        initial_retry_delay: Duration::ZERO,
        subsequent_retry_delay: Duration::ZERO,
        max_retries: 10,
        janitor_interval: Duration::from_millis(10),
    });

    let job_id = JobId::generate();
    let first = eval(job_id);
    let second = eval(job_id);
    broker.enqueue(first.clone())?;
    broker.enqueue(second.clone())?;

    // Deliver and let it expire.
    let (delivered, _stale) = broker
        .dequeue(&[JobType::Batch], Duration::from_millis(100))
        .await?
        .expect("delivery");
    assert_eq!(delivered.id, first.id);
    broker.tick(chrono::Utc::now() + chrono::Duration::seconds(1))?;

    // The redelivery must be the same evaluation, not the parked second
    // one.
    let (redelivered, receipt) = broker
        .dequeue(&[JobType::Batch], Duration::from_millis(100))
        .await?
        .expect("redelivery");
    assert_eq!(redelivered.id, first.id);

    broker.ack(&first.id, &receipt)?;
    let (promoted, receipt) = broker
        .dequeue(&[JobType::Batch], Duration::from_millis(100))
        .await?
        .expect("promotion after ack");
    assert_eq!(promoted.id, second.id);
    broker.ack(&second.id, &receipt)?;

    Ok(())
}
