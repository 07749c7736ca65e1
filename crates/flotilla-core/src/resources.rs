//! Compute resource accounting.
//!
//! [`Resources`] is the componentwise capacity vector used everywhere a task
//! asks for, a node advertises, or an execution allocates CPU, memory, disk
//! and GPUs. All comparisons are componentwise: a request *fits* an
//! availability only when every component fits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A componentwise vector of compute resources.
///
/// CPU is measured in millicores so fractional cores stay integral; memory
/// and disk are bytes; GPUs are whole devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// CPU in millicores (1000 = one core).
    pub cpu_millis: u64,
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// Disk in bytes.
    pub disk_bytes: u64,
    /// Whole GPU devices.
    pub gpu: u64,
}

impl Resources {
    /// Creates a resource vector.
    #[must_use]
    pub const fn new(cpu_millis: u64, memory_bytes: u64, disk_bytes: u64, gpu: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            disk_bytes,
            gpu,
        }
    }

    /// Returns true if `self` fits within `available`, componentwise.
    #[must_use]
    pub const fn fits(&self, available: &Self) -> bool {
        self.cpu_millis <= available.cpu_millis
            && self.memory_bytes <= available.memory_bytes
            && self.disk_bytes <= available.disk_bytes
            && self.gpu <= available.gpu
    }

    /// Componentwise sum.
    #[must_use]
    pub const fn add(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis + other.cpu_millis,
            memory_bytes: self.memory_bytes + other.memory_bytes,
            disk_bytes: self.disk_bytes + other.disk_bytes,
            gpu: self.gpu + other.gpu,
        }
    }

    /// Componentwise difference, saturating at zero.
    #[must_use]
    pub const fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Returns true if every component is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0 && self.disk_bytes == 0 && self.gpu == 0
    }
}

/// Resources allocated to an execution, keyed by task name.
///
/// The hard scheduling problems treat exactly one task per job, but the
/// record keeps the per-task shape so multi-task allocations stay
/// representable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocatedResources {
    /// Per-task resource allocations.
    pub tasks: HashMap<String, Resources>,
}

impl AllocatedResources {
    /// Creates an allocation holding a single task's resources.
    #[must_use]
    pub fn for_task(task_name: impl Into<String>, resources: Resources) -> Self {
        let mut tasks = HashMap::new();
        tasks.insert(task_name.into(), resources);
        Self { tasks }
    }

    /// Componentwise total across all tasks.
    #[must_use]
    pub fn total(&self) -> Resources {
        self.tasks
            .values()
            .fold(Resources::default(), |acc, r| acc.add(r))
    }
}
