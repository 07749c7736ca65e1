//! Host port allocation for networked tasks.
//!
//! Hands out host ports from a configured inclusive range, one set per
//! execution, released when the execution ends. Allocation is idempotent
//! per execution so a crash-restarted runner gets its original mappings
//! back.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use flotilla_core::error::{Error, Result};
use flotilla_core::id::ExecutionId;
use flotilla_core::network::{PortMap, PortMapping};

#[derive(Debug, Default)]
struct PortState {
    in_use: BTreeSet<u16>,
    by_execution: HashMap<ExecutionId, PortMap>,
}

/// Allocates host ports from an inclusive range.
#[derive(Debug)]
pub struct PortAllocator {
    low: u16,
    high: u16,
    state: Mutex<PortState>,
}

impl PortAllocator {
    /// Creates an allocator over the inclusive range `[low, high]`.
    #[must_use]
    pub fn new(low: u16, high: u16) -> Self {
        Self {
            low,
            high,
            state: Mutex::new(PortState::default()),
        }
    }

    /// Allocates a host port for each requested container port.
    ///
    /// Idempotent per execution: a repeated call returns the original
    /// mappings.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the range is exhausted.
    pub fn allocate(&self, execution_id: ExecutionId, container_ports: &[u16]) -> Result<PortMap> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::internal("port allocator lock poisoned"))?;

        if let Some(existing) = state.by_execution.get(&execution_id) {
            return Ok(existing.clone());
        }

        let mut mappings = PortMap::new();
        let mut candidate = self.low;
        for container_port in container_ports {
            let host_port = loop {
                if candidate > self.high {
                    // Roll back this execution's partial allocation.
                    for mapping in &mappings {
                        state.in_use.remove(&mapping.host_port);
                    }
                    return Err(Error::validation(format!(
                        "port range {}-{} exhausted",
                        self.low, self.high
                    )));
                }
                let port = candidate;
                candidate = candidate.saturating_add(1);
                if !state.in_use.contains(&port) {
                    break port;
                }
            };
            state.in_use.insert(host_port);
            mappings.push(PortMapping {
                container_port: *container_port,
                host_port,
            });
        }

        state.by_execution.insert(execution_id, mappings.clone());
        Ok(mappings)
    }

    /// Releases an execution's ports. Idempotent.
    pub fn release(&self, execution_id: &ExecutionId) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(mappings) = state.by_execution.remove(execution_id) {
                for mapping in mappings {
                    state.in_use.remove(&mapping.host_port);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_host_ports() {
        let allocator = PortAllocator::new(30000, 30010);
        let a = allocator
            .allocate(ExecutionId::generate(), &[80, 443])
            .unwrap();
        let b = allocator.allocate(ExecutionId::generate(), &[80]).unwrap();

        let mut hosts: Vec<u16> = a.iter().chain(b.iter()).map(|m| m.host_port).collect();
        hosts.sort_unstable();
        hosts.dedup();
        assert_eq!(hosts.len(), 3, "no host port handed out twice");
    }

    #[test]
    fn allocation_is_idempotent_per_execution() {
        let allocator = PortAllocator::new(30000, 30010);
        let id = ExecutionId::generate();
        let first = allocator.allocate(id, &[8080]).unwrap();
        let again = allocator.allocate(id, &[8080]).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn exhaustion_is_an_error_and_rolls_back() {
        let allocator = PortAllocator::new(30000, 30001);
        let hog = ExecutionId::generate();
        allocator.allocate(hog, &[1, 2]).unwrap();

        let starved = ExecutionId::generate();
        assert!(allocator.allocate(starved, &[3]).is_err());

        // Releasing frees the whole range again.
        allocator.release(&hog);
        assert!(allocator.allocate(starved, &[3, 4]).is_ok());
    }
}
