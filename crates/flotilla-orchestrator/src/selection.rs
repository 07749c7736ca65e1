//! Node discovery, filtering and ranking.
//!
//! For a job, [`NodeSelector::matching_nodes`] produces a ranked list of
//! eligible nodes plus the rejected ones with reasons:
//!
//! 1. **Discover**: pull live [`NodeState`] from the [`NodeDiscoverer`]
//! 2. **Filter**: membership, connection, capability support, capacity fit,
//!    label constraints, locality
//! 3. **Rank**: sum the scores of every [`NodeRanker`], add uniform random
//!    jitter bounded by the configured randomness range, sort descending
//!
//! Filtering subtracts the resources of live executions from each node's
//! advertised availability before the capacity check, so the orchestrator
//! never over-commits a node between compute-side heartbeats.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rand::Rng;

use flotilla_core::error::{Error, Result};
use flotilla_core::id::NodeId;
use flotilla_core::job::Job;
use flotilla_core::node::{Connection, Membership, NodeInfo, NodeState};
use flotilla_core::resources::Resources;

/// Converts a lock poison error to a datastore error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::datastore("node registry lock poisoned")
}

/// Source of live node state.
#[async_trait]
pub trait NodeDiscoverer: Send + Sync {
    /// Returns every node currently known, regardless of eligibility.
    async fn all_nodes(&self) -> Result<Vec<NodeState>>;
}

/// In-memory node catalog; doubles as the orchestrator's registry that
/// join/heartbeat/drain mutate.
#[derive(Debug, Default)]
pub struct NodeStateRegistry {
    nodes: RwLock<HashMap<NodeId, NodeState>>,
}

impl NodeStateRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a joining node as pending approval.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn join(&self, info: NodeInfo) -> Result<()> {
        let mut nodes = self.nodes.write().map_err(poison_err)?;
        tracing::info!(node_id = %info.id, "node joined");
        nodes.insert(info.id.clone(), NodeState::joined(info));
        Ok(())
    }

    /// Approves a node for placement.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown nodes.
    pub fn approve(&self, node_id: &NodeId) -> Result<()> {
        self.update(node_id, |state| state.membership = Membership::Approved)
    }

    /// Records a heartbeat, marking the node connected.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown nodes.
    pub fn heartbeat(&self, node_id: &NodeId) -> Result<()> {
        self.update(node_id, |state| {
            state.connection = Connection::Connected;
            state.last_heartbeat = Some(chrono::Utc::now());
        })
    }

    /// Marks a node disconnected (drain or missed heartbeats).
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown nodes.
    pub fn disconnect(&self, node_id: &NodeId) -> Result<()> {
        self.update(node_id, |state| state.connection = Connection::Disconnected)
    }

    fn update(&self, node_id: &NodeId, apply: impl FnOnce(&mut NodeState)) -> Result<()> {
        let mut nodes = self.nodes.write().map_err(poison_err)?;
        let state = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;
        apply(state);
        Ok(())
    }
}

#[async_trait]
impl NodeDiscoverer for NodeStateRegistry {
    async fn all_nodes(&self) -> Result<Vec<NodeState>> {
        let nodes = self.nodes.read().map_err(poison_err)?;
        Ok(nodes.values().cloned().collect())
    }
}

/// Whether a job's inputs must already be on the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locality {
    /// Any node able to fetch the inputs will do.
    #[default]
    Anywhere,
    /// The node must advertise every input source locally.
    Local,
}

/// A node's rank for one job.
#[derive(Debug, Clone)]
pub struct NodeRank {
    /// The ranked node's advertisement.
    pub info: NodeInfo,
    /// Sum of ranker scores plus jitter; meaningless for rejected nodes.
    pub score: f64,
    /// False if a filter or ranker rejected the node.
    pub meets_requirements: bool,
    /// Why the node was rejected, when it was.
    pub reason: String,
}

impl NodeRank {
    fn accepted(info: NodeInfo, score: f64) -> Self {
        Self {
            info,
            score,
            meets_requirements: true,
            reason: String::new(),
        }
    }

    fn rejected(info: NodeInfo, reason: impl Into<String>) -> Self {
        Self {
            info,
            score: f64::MIN,
            meets_requirements: false,
            reason: reason.into(),
        }
    }
}

/// The outcome of one ranker for one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    /// A score contribution; higher is better.
    Score(f64),
    /// The node must not run this job.
    Reject(String),
}

/// Scores nodes for a job.
pub trait NodeRanker: Send + Sync {
    /// Ranks one node for one job.
    fn rank(&self, job: &Job, node: &NodeState) -> Ranking;
}

/// Prefers nodes with more free capacity left after placing the task, so
/// load spreads instead of stacking.
#[derive(Debug, Default)]
pub struct AvailableCapacityRanker;

impl NodeRanker for AvailableCapacityRanker {
    #[allow(clippy::cast_precision_loss)]
    fn rank(&self, job: &Job, node: &NodeState) -> Ranking {
        let free = node
            .info
            .available_capacity
            .saturating_sub(&job.task().resources);
        // Normalise each component against the node's own maximum so big
        // and small nodes compete on headroom fraction, not absolute size.
        let max = node.info.max_capacity;
        let fraction = |free: u64, max: u64| {
            if max == 0 {
                1.0
            } else {
                free as f64 / max as f64
            }
        };
        let score = fraction(free.cpu_millis, max.cpu_millis)
            + fraction(free.memory_bytes, max.memory_bytes)
            + fraction(free.disk_bytes, max.disk_bytes)
            + fraction(free.gpu, max.gpu);
        Ranking::Score(score)
    }
}

/// Discovery + filter + rank pipeline over live node state.
pub struct NodeSelector {
    discoverer: Arc<dyn NodeDiscoverer>,
    rankers: Vec<Box<dyn NodeRanker>>,
    /// Jitter bound added to every accepted node's score.
    randomness_range: f64,
    locality: Locality,
}

impl NodeSelector {
    /// Creates a selector with the default ranker set.
    #[must_use]
    pub fn new(discoverer: Arc<dyn NodeDiscoverer>, randomness_range: f64) -> Self {
        Self {
            discoverer,
            rankers: vec![Box::new(AvailableCapacityRanker)],
            randomness_range,
            locality: Locality::Anywhere,
        }
    }

    /// Adds a ranker to the pipeline.
    #[must_use]
    pub fn with_ranker(mut self, ranker: Box<dyn NodeRanker>) -> Self {
        self.rankers.push(ranker);
        self
    }

    /// Sets the locality constraint.
    #[must_use]
    pub const fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// Returns every node currently known.
    ///
    /// # Errors
    ///
    /// Propagates discovery failures.
    pub async fn all_nodes(&self) -> Result<Vec<NodeState>> {
        self.discoverer.all_nodes().await
    }

    /// Returns the nodes able to run `job`, best first, plus the rejected
    /// nodes with reasons.
    ///
    /// `committed` maps node IDs to resources already allocated by live
    /// executions; it is subtracted from advertised availability before the
    /// capacity check.
    ///
    /// # Errors
    ///
    /// Propagates discovery failures.
    pub async fn matching_nodes(
        &self,
        job: &Job,
        committed: &HashMap<NodeId, Resources>,
    ) -> Result<(Vec<NodeRank>, Vec<NodeRank>)> {
        let nodes = self.discoverer.all_nodes().await?;
        let mut matched = Vec::new();
        let mut rejected = Vec::new();

        for mut node in nodes {
            if let Some(used) = committed.get(&node.info.id) {
                node.info.available_capacity =
                    node.info.available_capacity.saturating_sub(used);
            }
            match self.filter(job, &node) {
                Err(reason) => rejected.push(NodeRank::rejected(node.info, reason)),
                Ok(()) => match self.score(job, &node) {
                    Ranking::Reject(reason) => {
                        rejected.push(NodeRank::rejected(node.info, reason));
                    }
                    Ranking::Score(base) => {
                        let jitter = if self.randomness_range > 0.0 {
                            rand::thread_rng().gen_range(0.0..self.randomness_range)
                        } else {
                            0.0
                        };
                        matched.push(NodeRank::accepted(node.info, base + jitter));
                    }
                },
            }
        }

        matched.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.info.id.cmp(&b.info.id))
        });
        Ok((matched, rejected))
    }

    /// Hard eligibility checks; an `Err` is the rejection reason.
    fn filter(&self, job: &Job, node: &NodeState) -> std::result::Result<(), String> {
        if node.membership != Membership::Approved {
            return Err(format!("membership is {:?}", node.membership));
        }
        if node.connection != Connection::Connected {
            return Err("node is disconnected".to_string());
        }
        if !node.info.node_type.can_compute() {
            return Err(format!("node type {:?} cannot compute", node.info.node_type));
        }

        let task = job.task();
        if !node.info.supports_engine(&task.engine.kind) {
            return Err(format!("engine '{}' not supported", task.engine.kind));
        }
        for input in &task.input_sources {
            if !node.info.supports_storage(&input.source.kind) {
                return Err(format!("storage '{}' not supported", input.source.kind));
            }
        }
        if task.has_publisher() && !node.info.supports_publisher(&task.publisher.kind) {
            return Err(format!("publisher '{}' not supported", task.publisher.kind));
        }

        if !task.resources.fits(&node.info.available_capacity) {
            return Err(format!(
                "insufficient capacity: need {:?}, available {:?}",
                task.resources, node.info.available_capacity
            ));
        }

        if !job.constraints.matches(&node.info.labels) {
            return Err("labels do not satisfy job constraints".to_string());
        }

        if self.locality == Locality::Local {
            for input in &task.input_sources {
                if !node.info.holds_locally(&input.source) {
                    return Err(format!(
                        "input '{}' not held locally",
                        input.source.kind
                    ));
                }
            }
        }

        Ok(())
    }

    /// Sum of all ranker scores, or the first rejection.
    fn score(&self, job: &Job, node: &NodeState) -> Ranking {
        let mut total = 0.0;
        for ranker in &self.rankers {
            match ranker.rank(job, node) {
                Ranking::Score(score) => total += score,
                reject @ Ranking::Reject(_) => return reject,
            }
        }
        Ranking::Score(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::job::{JobType, Task};
    use flotilla_core::selector::{Operator, Requirement, Selector};
    use flotilla_core::spec_config::SpecConfig;

    const GB: u64 = 1024 * 1024 * 1024;

    fn job_needing(resources: Resources) -> Job {
        let mut task = Task::new("main", SpecConfig::new("noop"));
        task.resources = resources;
        Job::new("j", "default", JobType::Batch, task)
    }

    fn ready_node(name: &str, capacity: Resources) -> NodeState {
        let mut state = NodeState::joined(
            NodeInfo::compute(NodeId::new(name), capacity).with_engine("noop"),
        );
        state.membership = Membership::Approved;
        state
    }

    async fn select(
        nodes: Vec<NodeState>,
        job: &Job,
    ) -> (Vec<NodeRank>, Vec<NodeRank>) {
        let registry = Arc::new(NodeStateRegistry::new());
        for node in nodes {
            registry.join(node.info.clone()).unwrap();
            if node.membership == Membership::Approved {
                registry.approve(&node.info.id).unwrap();
            }
            if node.connection == Connection::Disconnected {
                registry.disconnect(&node.info.id).unwrap();
            }
        }
        let selector = NodeSelector::new(registry, 0.0);
        selector
            .matching_nodes(job, &HashMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unapproved_and_disconnected_nodes_are_rejected() {
        let job = job_needing(Resources::new(100, 0, 0, 0));
        let approved = ready_node("a", Resources::new(1000, GB, GB, 0));
        let mut pending = ready_node("b", Resources::new(1000, GB, GB, 0));
        pending.membership = Membership::Pending;
        let mut gone = ready_node("c", Resources::new(1000, GB, GB, 0));
        gone.connection = Connection::Disconnected;

        let (matched, rejected) = select(vec![approved, pending, gone], &job).await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].info.id.as_str(), "a");
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|r| !r.meets_requirements));
    }

    #[tokio::test]
    async fn missing_engine_support_rejects() {
        let mut job = job_needing(Resources::new(100, 0, 0, 0));
        job.tasks[0].engine = SpecConfig::new("docker");
        let node = ready_node("a", Resources::new(1000, GB, GB, 0));

        let (matched, rejected) = select(vec![node], &job).await;
        assert!(matched.is_empty());
        assert!(rejected[0].reason.contains("engine"));
    }

    #[tokio::test]
    async fn capacity_check_subtracts_committed_resources() {
        let job = job_needing(Resources::new(1000, 0, 0, 0));
        let registry = Arc::new(NodeStateRegistry::new());
        let node = ready_node("a", Resources::new(1500, GB, GB, 0));
        registry.join(node.info.clone()).unwrap();
        registry.approve(&node.info.id).unwrap();

        let selector = NodeSelector::new(registry, 0.0);

        let mut committed = HashMap::new();
        committed.insert(NodeId::new("a"), Resources::new(1000, 0, 0, 0));
        let (matched, rejected) = selector.matching_nodes(&job, &committed).await.unwrap();
        assert!(matched.is_empty());
        assert!(rejected[0].reason.contains("capacity"));

        let (matched, _) = selector.matching_nodes(&job, &HashMap::new()).await.unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn label_constraints_filter_nodes() {
        let mut job = job_needing(Resources::new(100, 0, 0, 0));
        job.constraints = Selector::new(vec![Requirement::new(
            "zone",
            Operator::Equals,
            vec!["eu-1".into()],
        )
        .unwrap()]);

        let mut in_zone = ready_node("a", Resources::new(1000, GB, GB, 0));
        in_zone.info.labels.insert("zone".into(), "eu-1".into());
        let out_of_zone = ready_node("b", Resources::new(1000, GB, GB, 0));

        let (matched, rejected) = select(vec![in_zone, out_of_zone], &job).await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].info.id.as_str(), "a");
        assert!(rejected[0].reason.contains("labels"));
    }

    #[tokio::test]
    async fn ranking_prefers_headroom() {
        let job = job_needing(Resources::new(100, 0, 0, 0));
        let big = ready_node("roomy", Resources::new(8000, 8 * GB, GB, 0));
        let mut small = ready_node("tight", Resources::new(8000, 8 * GB, GB, 0));
        small.info.available_capacity = Resources::new(200, GB, GB, 0);

        let (matched, _) = select(vec![small, big], &job).await;
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].info.id.as_str(), "roomy");
    }

    #[tokio::test]
    async fn local_locality_requires_local_inputs() {
        let mut job = job_needing(Resources::new(100, 0, 0, 0));
        let source = SpecConfig::new("s3").with_param("bucket", "inputs");
        job.tasks[0].input_sources.push(flotilla_core::job::InputSource {
            source: source.clone(),
            target: "/inputs".into(),
        });

        let registry = Arc::new(NodeStateRegistry::new());
        let mut holder = ready_node("holder", Resources::new(1000, GB, GB, 0));
        holder.info.storages.push("s3".into());
        holder.info.local_sources.push(source);
        let mut fetcher = ready_node("fetcher", Resources::new(1000, GB, GB, 0));
        fetcher.info.storages.push("s3".into());

        for node in [&holder, &fetcher] {
            registry.join(node.info.clone()).unwrap();
            registry.approve(&node.info.id).unwrap();
        }

        let selector =
            NodeSelector::new(Arc::clone(&registry) as Arc<dyn NodeDiscoverer>, 0.0)
                .with_locality(Locality::Local);
        let (matched, rejected) =
            selector.matching_nodes(&job, &HashMap::new()).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].info.id.as_str(), "holder");
        assert!(rejected[0].reason.contains("not held locally"));
    }
}
