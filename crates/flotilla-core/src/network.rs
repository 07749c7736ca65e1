//! Task network configuration.

use serde::{Deserialize, Serialize};

/// How a task is attached to the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    /// No network access.
    None,
    /// Use the node's configured default network type.
    #[default]
    Default,
    /// Share the host network namespace.
    Host,
    /// Unrestricted egress and ingress.
    Full,
    /// An isolated bridge network with published ports.
    Bridge,
}

impl NetworkKind {
    /// Returns true if the task gets any network access at all.
    #[must_use]
    pub const fn is_networked(&self) -> bool {
        !matches!(self, Self::None | Self::Default)
    }
}

impl std::fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Default => "default",
            Self::Host => "host",
            Self::Full => "full",
            Self::Bridge => "bridge",
        };
        write!(f, "{s}")
    }
}

/// A single container-port to host-port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// The port inside the task.
    pub container_port: u16,
    /// The port on the host, assigned by the allocator.
    pub host_port: u16,
}

/// The set of port mappings allocated to an execution.
pub type PortMap = Vec<PortMapping>;

/// Network configuration for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// The kind of network attachment.
    pub kind: NetworkKind,
    /// Container ports the task wants exposed; host ports are filled in by
    /// the port allocator at execution time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
}

impl NetworkConfig {
    /// Creates a network config of the given kind with no ports.
    #[must_use]
    pub fn new(kind: NetworkKind) -> Self {
        Self {
            kind,
            ports: Vec::new(),
        }
    }

    /// Adds a container port to expose.
    #[must_use]
    pub fn with_port(mut self, container_port: u16) -> Self {
        self.ports.push(container_port);
        self
    }
}
