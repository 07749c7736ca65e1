//! Shared harness for end-to-end scenarios: an in-process cluster wiring the
//! store, broker, workers, store watcher and any number of compute nodes
//! around a controllable test backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use flotilla_core::error::Result;
use flotilla_core::evaluation::{trigger, Evaluation};
use flotilla_core::execution::{Execution, RunResult};
use flotilla_core::id::{EvalId, ExecutionId, NodeId};
use flotilla_core::job::Job;
use flotilla_core::node::NodeInfo;
use flotilla_core::resources::Resources;
use flotilla_core::spec_config::SpecConfig;
use flotilla_core::store::memory::InMemoryExecutionStore;
use flotilla_core::store::ExecutionStore;

use flotilla_orchestrator::broker::EvaluationBroker;
use flotilla_orchestrator::config::{BrokerConfig, SchedulerConfig};
use flotilla_orchestrator::planner::Planner;
use flotilla_orchestrator::retry::AttemptCountStrategy;
use flotilla_orchestrator::scheduler::batch::BatchServiceScheduler;
use flotilla_orchestrator::scheduler::daemon::DaemonOpsScheduler;
use flotilla_orchestrator::scheduler::{SchedulerProvider, WorldBuilder};
use flotilla_orchestrator::selection::{NodeSelector, NodeStateRegistry};
use flotilla_orchestrator::state::{EvaluationSet, JobSet};
use flotilla_orchestrator::watcher::StoreWatcher;
use flotilla_orchestrator::worker::WorkerPool;

use flotilla_compute::bidder::{BidStrategy, ChainedBidStrategy, NetworkingStrategy};
use flotilla_compute::capability::{
    BackendError, ExecutorBackend, Provider, ResultPublisher, RunSpec, StorageMount,
};
use flotilla_compute::capacity::CapacityTracker;
use flotilla_compute::config::ComputeConfig;
use flotilla_compute::env::EnvResolver;
use flotilla_compute::node::ComputeNode;
use flotilla_compute::ports::PortAllocator;
use flotilla_compute::results::ResultsPath;
use flotilla_compute::runner::ExecutionRunner;

/// Engine kind the test backend answers to.
pub const TEST_ENGINE: &str = "noop";

struct RunEntry {
    sleep: Duration,
    fail_with: Option<String>,
    cancelled: Arc<Notify>,
}

/// Controllable executor backend.
///
/// Engine params: `sleepMillis` (how long the "task" runs) and `failWith`
/// (a runner error message). Tracks the concurrency high-water mark so
/// tests can assert capacity was respected.
#[derive(Default)]
pub struct TestBackend {
    runs: Mutex<HashMap<ExecutionId, Arc<RunEntry>>>,
    current: AtomicUsize,
    high_water: AtomicUsize,
    started: AtomicUsize,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The most concurrent runs ever observed.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    /// How many runs were started in total.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutorBackend for TestBackend {
    async fn start(&self, spec: RunSpec) -> std::result::Result<(), BackendError> {
        let mut runs = self.runs.lock().expect("lock");
        if runs.contains_key(&spec.execution_id) {
            return Err(BackendError::AlreadyStarted);
        }
        let sleep = spec
            .engine
            .param("sleepMillis")
            .and_then(serde_json::Value::as_u64)
            .map_or(Duration::ZERO, Duration::from_millis);
        let fail_with = spec
            .engine
            .param("failWith")
            .and_then(serde_json::Value::as_str)
            .map(String::from);
        runs.insert(
            spec.execution_id,
            Arc::new(RunEntry {
                sleep,
                fail_with,
                cancelled: Arc::new(Notify::new()),
            }),
        );
        self.started.fetch_add(1, Ordering::SeqCst);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(current, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(
        &self,
        execution_id: ExecutionId,
    ) -> std::result::Result<RunResult, BackendError> {
        let entry = {
            let runs = self.runs.lock().expect("lock");
            runs.get(&execution_id).cloned()
        };
        let Some(entry) = entry else {
            return Err(BackendError::NotFound);
        };

        let outcome = tokio::select! {
            () = tokio::time::sleep(entry.sleep) => {
                if let Some(message) = &entry.fail_with {
                    Ok(RunResult {
                        exit_code: 1,
                        error_message: message.clone(),
                        ..RunResult::default()
                    })
                } else {
                    Ok(RunResult::default())
                }
            }
            () = entry.cancelled.notified() => Err(BackendError::AlreadyCancelled),
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn cancel(&self, execution_id: ExecutionId) -> std::result::Result<(), BackendError> {
        let runs = self.runs.lock().expect("lock");
        match runs.get(&execution_id) {
            Some(entry) => {
                entry.cancelled.notify_waiters();
                Ok(())
            }
            None => Err(BackendError::NotFound),
        }
    }
}

/// Publisher that records whether it was invoked.
#[derive(Default)]
pub struct TestPublisher {
    pub published: AtomicBool,
}

#[async_trait]
impl ResultPublisher for TestPublisher {
    async fn publish_result(
        &self,
        execution: &Execution,
        _results_dir: &Path,
    ) -> Result<SpecConfig> {
        self.published.store(true, Ordering::SeqCst);
        Ok(SpecConfig::new("local").with_param("executionId", execution.id.to_string()))
    }
}

/// Storage mount that stages nothing and remembers nothing.
#[derive(Default)]
pub struct TestStorage;

#[async_trait]
impl StorageMount for TestStorage {
    async fn has_resource_locally(&self, _source: &SpecConfig) -> Result<bool> {
        Ok(false)
    }

    async fn prepare(
        &self,
        _execution_id: ExecutionId,
        input: &flotilla_core::job::InputSource,
        staging_dir: &Path,
    ) -> Result<flotilla_compute::capability::PreparedStorage> {
        Ok(flotilla_compute::capability::PreparedStorage {
            input: input.clone(),
            volume_path: staging_dir.to_path_buf(),
        })
    }

    async fn clean(
        &self,
        _prepared: &flotilla_compute::capability::PreparedStorage,
    ) -> Result<()> {
        Ok(())
    }
}

/// Per-node options for the harness.
pub struct TestNodeSpec {
    pub name: &'static str,
    pub capacity: Resources,
    pub reject_networked: bool,
}

impl TestNodeSpec {
    pub fn new(name: &'static str, capacity: Resources) -> Self {
        Self {
            name,
            capacity,
            reject_networked: false,
        }
    }

    pub fn rejecting_networked(mut self) -> Self {
        self.reject_networked = true;
        self
    }
}

/// An in-process cluster: store, broker, workers, watcher and compute nodes.
pub struct TestCluster {
    pub store: Arc<InMemoryExecutionStore>,
    pub broker: EvaluationBroker,
    pub jobs: Arc<JobSet>,
    pub evaluations: Arc<EvaluationSet>,
    pub publisher: Arc<TestPublisher>,
    pub backends: HashMap<NodeId, Arc<TestBackend>>,
    token: CancellationToken,
    workers: Option<WorkerPool>,
}

impl TestCluster {
    /// Starts a cluster with the given compute nodes.
    pub async fn start(nodes: Vec<TestNodeSpec>) -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let store = Arc::new(InMemoryExecutionStore::new());
        let store_dyn: Arc<dyn ExecutionStore> = store.clone();
        let registry = Arc::new(NodeStateRegistry::new());
        let jobs = Arc::new(JobSet::new());
        let evaluations = Arc::new(EvaluationSet::new());
        let publisher = Arc::new(TestPublisher::default());
        let token = CancellationToken::new();

        let broker = EvaluationBroker::new(BrokerConfig {
            visibility_timeout: Duration::from_secs(10),
            initial_retry_delay: Duration::ZERO,
            subsequent_retry_delay: Duration::from_millis(100),
            max_retries: 20,
            janitor_interval: Duration::from_millis(25),
        });
        let _janitor = broker.start_janitor(token.clone());

        let scheduler_config = SchedulerConfig {
            workers: 2,
            randomness_range: 0.0,
            over_ask_for_bids_factor: 1,
            dequeue_timeout: Duration::from_millis(50),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
            worker_max_retries: 5,
            queue_backoff: Duration::from_millis(100),
        };

        let retry = Arc::new(AttemptCountStrategy::default());
        let provider = Arc::new(
            SchedulerProvider::new()
                .with_scheduler(
                    flotilla_core::job::JobType::Batch,
                    Arc::new(BatchServiceScheduler::new(
                        retry.clone(),
                        scheduler_config.over_ask_for_bids_factor,
                        scheduler_config.queue_backoff,
                    )),
                )
                .with_scheduler(
                    flotilla_core::job::JobType::Service,
                    Arc::new(BatchServiceScheduler::new(
                        retry.clone(),
                        scheduler_config.over_ask_for_bids_factor,
                        scheduler_config.queue_backoff,
                    )),
                )
                .with_scheduler(
                    flotilla_core::job::JobType::Daemon,
                    Arc::new(DaemonOpsScheduler::new(retry.clone())),
                )
                .with_scheduler(
                    flotilla_core::job::JobType::Ops,
                    Arc::new(DaemonOpsScheduler::new(retry)),
                ),
        );

        let selector = Arc::new(NodeSelector::new(
            registry.clone(),
            scheduler_config.randomness_range,
        ));
        let world = Arc::new(WorldBuilder::new(
            jobs.clone(),
            store_dyn.clone(),
            selector,
        ));
        let planner = Arc::new(Planner::new(
            store_dyn.clone(),
            broker.clone(),
            evaluations.clone(),
        ));

        // Follow-up evaluations for failed/rejected executions.
        let mut store_watcher = StoreWatcher::new(
            store_dyn.clone(),
            broker.clone(),
            evaluations.clone(),
            0,
        );
        let watcher_token = token.clone();
        tokio::spawn(async move {
            let _ = store_watcher.run(watcher_token).await;
        });

        let workers = WorkerPool::start(
            broker.clone(),
            provider,
            planner,
            world,
            evaluations.clone(),
            &scheduler_config,
            token.child_token(),
        );

        let mut backends = HashMap::new();
        for spec in nodes {
            let node_id = NodeId::new(spec.name);
            let backend = TestBackend::new();
            backends.insert(node_id.clone(), backend.clone());

            let info = NodeInfo::compute(node_id.clone(), spec.capacity)
                .with_engine(TEST_ENGINE)
                .with_storage("test")
                .with_publisher("local");
            registry.join(info)?;
            registry.approve(&node_id)?;

            let executors: Arc<Provider<dyn ExecutorBackend>> =
                Arc::new(Provider::new().with(TEST_ENGINE, backend as Arc<dyn ExecutorBackend>));
            let storages: Arc<Provider<dyn StorageMount>> = Arc::new(
                Provider::new().with("test", Arc::new(TestStorage) as Arc<dyn StorageMount>),
            );
            let publishers: Arc<Provider<dyn ResultPublisher>> = Arc::new(
                Provider::new()
                    .with("local", publisher.clone() as Arc<dyn ResultPublisher>),
            );
            let capacity = Arc::new(CapacityTracker::new(spec.capacity));
            let results_root = std::env::temp_dir()
                .join("flotilla-e2e")
                .join(format!("{}-{}", spec.name, EvalId::generate()));
            let runner = Arc::new(ExecutionRunner::new(
                node_id.clone(),
                store_dyn.clone(),
                executors,
                storages,
                publishers,
                Arc::new(PortAllocator::new(30000, 31000)),
                EnvResolver::new(),
                ResultsPath::new(results_root),
                capacity.clone(),
                ComputeConfig {
                    root_cleanup_delay: Duration::from_secs(3600),
                    ..ComputeConfig::default()
                },
            ));
            let strategy: Arc<dyn BidStrategy> = if spec.reject_networked {
                Arc::new(
                    ChainedBidStrategy::new()
                        .with(Arc::new(NetworkingStrategy::new(true))),
                )
            } else {
                Arc::new(ChainedBidStrategy::new())
            };
            let node = ComputeNode::new(
                node_id,
                store_dyn.clone(),
                runner,
                strategy,
                capacity,
            );
            let node_token = token.clone();
            tokio::spawn(async move {
                let _ = node.run(0, node_token).await;
            });
        }

        Ok(Self {
            store,
            broker,
            jobs,
            evaluations,
            publisher,
            backends,
            token,
            workers: Some(workers),
        })
    }

    /// Submits a job: registers it and enqueues its first evaluation.
    pub fn submit(&self, job: Job) -> Result<EvalId> {
        self.jobs.insert(job.clone())?;
        let evaluation = Evaluation::new(
            job.id,
            job.namespace.clone(),
            job.job_type,
            trigger::JOB_REGISTER,
        )
        .with_priority(job.priority);
        let eval_id = evaluation.id;
        self.evaluations.insert(evaluation.clone())?;
        self.broker.enqueue(evaluation)?;
        Ok(eval_id)
    }

    /// Polls the job's executions until `predicate` holds or `timeout`
    /// elapses; returns the final snapshot.
    pub async fn wait_for(
        &self,
        job: &Job,
        timeout: Duration,
        predicate: impl Fn(&[Execution]) -> bool,
    ) -> Vec<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let executions = self
                .store
                .get_executions(&job.id)
                .await
                .unwrap_or_default();
            if predicate(&executions) {
                return executions;
            }
            if tokio::time::Instant::now() >= deadline {
                return executions;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Drains the cluster: stop dequeue, stop workers, stop nodes.
    pub async fn shutdown(mut self) {
        let _ = self.broker.shutdown();
        if let Some(workers) = self.workers.take() {
            workers.drain().await;
        }
        self.token.cancel();
    }
}
