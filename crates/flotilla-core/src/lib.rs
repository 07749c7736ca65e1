//! # flotilla-core
//!
//! Core abstractions for the Flotilla distributed compute orchestrator.
//!
//! This crate provides the foundational types and contracts used across all
//! Flotilla components:
//!
//! - **Identifiers**: Strongly-typed IDs for jobs, evaluations and executions
//! - **Domain Model**: Jobs, tasks, executions, evaluations, node state, events
//! - **Execution Store**: The transactional, versioned execution-log contract
//!   and an in-memory implementation
//! - **Error Types**: Shared error taxonomy with retryability classification
//!
//! ## Crate Boundary
//!
//! `flotilla-core` is the **only** crate allowed to define shared primitives.
//! The orchestrator and compute crates interact exclusively through the
//! records and store contract defined here: the orchestrator owns jobs,
//! evaluations and the desired state of executions; a compute node owns the
//! observed compute state and run output of the executions placed on it. The
//! store reconciles the two writers with compare-and-set preconditions.
//!
//! ## Example
//!
//! ```rust
//! use flotilla_core::prelude::*;
//!
//! let job_id = JobId::generate();
//! let eval = Evaluation::new(job_id, "default", JobType::Batch, trigger::JOB_REGISTER);
//! assert_eq!(eval.status, EvalStatus::Pending);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod event;
pub mod evaluation;
pub mod execution;
pub mod id;
pub mod job;
pub mod network;
pub mod node;
pub mod resources;
pub mod selector;
pub mod spec_config;
pub mod store;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use flotilla_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::evaluation::{trigger, EvalStatus, Evaluation};
    pub use crate::event::{topics, Event};
    pub use crate::execution::{ComputeState, DesiredState, Execution, RunResult, State};
    pub use crate::id::{EvalId, ExecutionId, JobId, NodeId};
    pub use crate::job::{InputSource, Job, JobType, Task, TaskTimeouts};
    pub use crate::network::{NetworkConfig, NetworkKind, PortMap, PortMapping};
    pub use crate::node::{Connection, Membership, NodeInfo, NodeState, NodeType};
    pub use crate::resources::{AllocatedResources, Resources};
    pub use crate::selector::{Operator, Requirement, Selector};
    pub use crate::spec_config::SpecConfig;
    pub use crate::store::{
        memory::InMemoryExecutionStore, ChangeKind, ExecutionChange, ExecutionStore,
        ExecutionUpdate, ExecutionWatcher, NodeExecutionFilter, UpdateCondition,
        UpdateExecutionRequest,
    };
}
