//! Node identity, capabilities and liveness.
//!
//! [`NodeInfo`] is what a node advertises about itself: labels, capability
//! kinds and capacity. [`NodeState`] wraps it with the orchestrator's view of
//! membership and connection liveness. A node is eligible for placement only
//! when approved, connected and fitting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::id::NodeId;
use crate::resources::Resources;
use crate::spec_config::SpecConfig;

/// The role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Runs executions.
    Compute,
    /// Orchestrates only.
    Requester,
    /// Both.
    Hybrid,
}

impl NodeType {
    /// Returns true if the node can run executions.
    #[must_use]
    pub const fn can_compute(&self) -> bool {
        matches!(self, Self::Compute | Self::Hybrid)
    }
}

/// The orchestrator's admission decision for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    /// Awaiting approval.
    #[default]
    Pending,
    /// Admitted to the fleet.
    Approved,
    /// Refused.
    Rejected,
}

/// Whether the node's transport link is up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connection {
    /// Heartbeats are arriving.
    Connected,
    /// The link is down or heartbeats stopped.
    #[default]
    Disconnected,
}

/// What a node advertises about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// The node's name.
    pub id: NodeId,
    /// Operator-assigned labels, matched against job constraints.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// The node's role.
    pub node_type: NodeType,
    /// Engine kinds the node can run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub engines: Vec<String>,
    /// Storage kinds the node can stage inputs from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storages: Vec<String>,
    /// Publisher kinds the node can publish results with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publishers: Vec<String>,
    /// Input sources the node already holds locally, for locality-constrained
    /// placement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_sources: Vec<SpecConfig>,
    /// Total capacity the node advertises.
    pub max_capacity: Resources,
    /// Capacity currently uncommitted.
    pub available_capacity: Resources,
}

impl NodeInfo {
    /// Creates a compute node advertisement with the given capacity.
    ///
    /// Available capacity starts equal to max capacity.
    #[must_use]
    pub fn compute(id: NodeId, max_capacity: Resources) -> Self {
        Self {
            id,
            labels: HashMap::new(),
            node_type: NodeType::Compute,
            engines: Vec::new(),
            storages: Vec::new(),
            publishers: Vec::new(),
            local_sources: Vec::new(),
            max_capacity,
            available_capacity: max_capacity,
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds a supported engine kind.
    #[must_use]
    pub fn with_engine(mut self, kind: impl Into<String>) -> Self {
        self.engines.push(kind.into());
        self
    }

    /// Adds a supported storage kind.
    #[must_use]
    pub fn with_storage(mut self, kind: impl Into<String>) -> Self {
        self.storages.push(kind.into());
        self
    }

    /// Adds a supported publisher kind.
    #[must_use]
    pub fn with_publisher(mut self, kind: impl Into<String>) -> Self {
        self.publishers.push(kind.into());
        self
    }

    /// Returns true if the node supports the given engine kind.
    #[must_use]
    pub fn supports_engine(&self, kind: &str) -> bool {
        self.engines.iter().any(|e| e.eq_ignore_ascii_case(kind))
    }

    /// Returns true if the node supports the given storage kind.
    #[must_use]
    pub fn supports_storage(&self, kind: &str) -> bool {
        self.storages.iter().any(|s| s.eq_ignore_ascii_case(kind))
    }

    /// Returns true if the node supports the given publisher kind.
    #[must_use]
    pub fn supports_publisher(&self, kind: &str) -> bool {
        self.publishers.iter().any(|p| p.eq_ignore_ascii_case(kind))
    }

    /// Returns true if the node advertises the given source locally.
    #[must_use]
    pub fn holds_locally(&self, source: &SpecConfig) -> bool {
        self.local_sources.iter().any(|s| s == source)
    }
}

/// The orchestrator's full view of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// The node's advertisement.
    pub info: NodeInfo,
    /// Admission decision.
    pub membership: Membership,
    /// Transport liveness.
    pub connection: Connection,
    /// When the last heartbeat arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl NodeState {
    /// Creates a node state for a freshly joined node: pending approval,
    /// connected.
    #[must_use]
    pub fn joined(info: NodeInfo) -> Self {
        Self {
            info,
            membership: Membership::Pending,
            connection: Connection::Connected,
            last_heartbeat: Some(Utc::now()),
        }
    }

    /// Returns true if the node may receive placements at all: approved,
    /// connected and able to compute. Capacity and capability fit are
    /// per-job checks layered on top.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.membership == Membership::Approved
            && self.connection == Connection::Connected
            && self.info.node_type.can_compute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(membership: Membership, connection: Connection) -> NodeState {
        let mut state = NodeState::joined(NodeInfo::compute(
            NodeId::new("n1"),
            Resources::new(2000, 1024, 1024, 0),
        ));
        state.membership = membership;
        state.connection = connection;
        state
    }

    #[test]
    fn only_approved_connected_compute_is_eligible() {
        assert!(node(Membership::Approved, Connection::Connected).is_eligible());
        assert!(!node(Membership::Pending, Connection::Connected).is_eligible());
        assert!(!node(Membership::Rejected, Connection::Connected).is_eligible());
        assert!(!node(Membership::Approved, Connection::Disconnected).is_eligible());
    }

    #[test]
    fn requester_nodes_never_compute() {
        let mut state = node(Membership::Approved, Connection::Connected);
        state.info.node_type = NodeType::Requester;
        assert!(!state.is_eligible());
    }

    #[test]
    fn capability_checks_ignore_case() {
        let info = NodeInfo::compute(NodeId::new("n1"), Resources::default())
            .with_engine("Docker")
            .with_storage("s3");
        assert!(info.supports_engine("docker"));
        assert!(info.supports_storage("S3"));
        assert!(!info.supports_publisher("ipfs"));
    }
}
