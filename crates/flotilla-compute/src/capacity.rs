//! Per-node capacity accounting.
//!
//! The orchestrator filters nodes by advertised availability, but the node
//! itself has the last word: a bid is only accepted if the tracker can
//! reserve the execution's resources against the node's real capacity. This
//! is what keeps concurrent placements from oversubscribing a node even when
//! two orchestrator workers race.

use std::collections::HashMap;
use std::sync::Mutex;

use flotilla_core::id::ExecutionId;
use flotilla_core::resources::Resources;

/// Tracks resources committed to live executions on one node.
#[derive(Debug)]
pub struct CapacityTracker {
    max: Resources,
    reserved: Mutex<HashMap<ExecutionId, Resources>>,
}

impl CapacityTracker {
    /// Creates a tracker for a node with the given total capacity.
    #[must_use]
    pub fn new(max: Resources) -> Self {
        Self {
            max,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// The node's total capacity.
    #[must_use]
    pub const fn max(&self) -> Resources {
        self.max
    }

    /// Attempts to reserve resources for an execution.
    ///
    /// Idempotent: re-reserving for an execution that already holds a
    /// reservation succeeds without double-counting.
    pub fn try_reserve(&self, execution_id: ExecutionId, resources: Resources) -> bool {
        let Ok(mut reserved) = self.reserved.lock() else {
            return false;
        };
        if reserved.contains_key(&execution_id) {
            return true;
        }
        let used = reserved
            .values()
            .fold(Resources::default(), |acc, r| acc.add(r));
        if !used.add(&resources).fits(&self.max) {
            return false;
        }
        reserved.insert(execution_id, resources);
        true
    }

    /// Releases an execution's reservation. Idempotent.
    pub fn release(&self, execution_id: &ExecutionId) {
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved.remove(execution_id);
        }
    }

    /// Resources currently reserved.
    #[must_use]
    pub fn used(&self) -> Resources {
        self.reserved.lock().map_or_else(
            |_| Resources::default(),
            |reserved| {
                reserved
                    .values()
                    .fold(Resources::default(), |acc, r| acc.add(r))
            },
        )
    }

    /// Capacity left unreserved.
    #[must_use]
    pub fn available(&self) -> Resources {
        self.max.saturating_sub(&self.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn reservations_respect_the_cap() {
        let tracker = CapacityTracker::new(Resources::new(2000, GB, GB, 0));
        let first = ExecutionId::generate();
        let second = ExecutionId::generate();
        let third = ExecutionId::generate();

        assert!(tracker.try_reserve(first, Resources::new(1000, GB / 2, 0, 0)));
        assert!(tracker.try_reserve(second, Resources::new(1000, GB / 2, 0, 0)));
        assert!(!tracker.try_reserve(third, Resources::new(1, 0, 0, 0)));

        tracker.release(&first);
        assert!(tracker.try_reserve(third, Resources::new(1000, 0, 0, 0)));
    }

    #[test]
    fn reserve_is_idempotent_per_execution() {
        let tracker = CapacityTracker::new(Resources::new(1000, 0, 0, 0));
        let id = ExecutionId::generate();
        assert!(tracker.try_reserve(id, Resources::new(1000, 0, 0, 0)));
        assert!(tracker.try_reserve(id, Resources::new(1000, 0, 0, 0)));
        assert_eq!(tracker.used(), Resources::new(1000, 0, 0, 0));
    }

    #[test]
    fn release_is_idempotent() {
        let tracker = CapacityTracker::new(Resources::new(1000, 0, 0, 0));
        let id = ExecutionId::generate();
        assert!(tracker.try_reserve(id, Resources::new(500, 0, 0, 0)));
        tracker.release(&id);
        tracker.release(&id);
        assert!(tracker.used().is_zero());
    }
}
