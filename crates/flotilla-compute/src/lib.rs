//! # flotilla-compute
//!
//! The compute-side half of Flotilla: everything a node does between
//! observing an execution assigned to it and writing a terminal state back.
//!
//! - **Watch loop**: [`node::ComputeNode`] follows the execution store's
//!   change feed and reconciles each execution it owns
//! - **Bidder**: semantic [`bidder::BidStrategy`] chain deciding whether the
//!   node bids on an ask
//! - **Runner**: [`runner::ExecutionRunner`] drives one execution through
//!   input staging, port allocation, env resolution, the executor backend,
//!   publishing and cleanup
//! - **Capability contracts**: [`capability::ExecutorBackend`],
//!   [`capability::StorageMount`] and [`capability::ResultPublisher`]
//!   registries for the pluggable backends
//!
//! A compute node owns exactly two fields of an execution record: the
//! observed compute state and the run output. Everything it writes goes
//! through compare-and-set store updates, so a racing orchestrator decision
//! (a stop, a bid rejection) always wins or loses cleanly, never silently.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bidder;
pub mod capability;
pub mod capacity;
pub mod config;
pub mod env;
pub mod node;
pub mod ports;
pub mod results;
pub mod runner;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bidder::{
        BidRequest, BidResponse, BidStrategy, ChainedBidStrategy, NetworkingStrategy,
        ResourceCapacityStrategy,
    };
    pub use crate::capability::{
        BackendError, ExecutorBackend, PreparedStorage, Provider, ResultPublisher, RunSpec,
        StorageMount,
    };
    pub use crate::capacity::CapacityTracker;
    pub use crate::config::{ComputeConfig, OutputLimits};
    pub use crate::env::EnvResolver;
    pub use crate::node::ComputeNode;
    pub use crate::ports::PortAllocator;
    pub use crate::results::ResultsPath;
    pub use crate::runner::ExecutionRunner;
}
