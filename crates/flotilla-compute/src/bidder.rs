//! Bid strategies: a node's advisory say over what it runs.
//!
//! Before committing to an execution, the node runs the ask through a chain
//! of semantic strategies. Any rejection declines the bid with that
//! strategy's reason; the orchestrator places the partition elsewhere.

use std::sync::Arc;

use flotilla_core::error::Result;
use flotilla_core::job::Job;
use flotilla_core::resources::Resources;

/// What a strategy gets to look at.
#[derive(Debug, Clone)]
pub struct BidRequest {
    /// The job being asked about (snapshot from the execution).
    pub job: Job,
}

/// A strategy's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidResponse {
    /// True to bid on the job.
    pub should_bid: bool,
    /// Why, for the event history.
    pub reason: String,
}

impl BidResponse {
    /// An accepting verdict.
    #[must_use]
    pub fn accept() -> Self {
        Self {
            should_bid: true,
            reason: String::new(),
        }
    }

    /// A declining verdict with a reason.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            should_bid: false,
            reason: reason.into(),
        }
    }
}

/// Decides whether this node bids on a job.
pub trait BidStrategy: Send + Sync {
    /// Returns the node's verdict on the ask.
    ///
    /// # Errors
    ///
    /// Strategy evaluation failures decline the bid.
    fn should_bid(&self, request: &BidRequest) -> Result<BidResponse>;
}

/// Declines networked jobs when the node has networking disabled.
///
/// `None` and `Default` asks are always acceptable; `Host`, `Full` and
/// `Bridge` are declined iff the strategy rejects networking.
#[derive(Debug, Clone, Copy)]
pub struct NetworkingStrategy {
    reject_networked: bool,
}

impl NetworkingStrategy {
    /// Creates the strategy; `reject_networked` declines networked jobs.
    #[must_use]
    pub const fn new(reject_networked: bool) -> Self {
        Self { reject_networked }
    }
}

impl BidStrategy for NetworkingStrategy {
    fn should_bid(&self, request: &BidRequest) -> Result<BidResponse> {
        let kind = request.job.task().network.kind;
        if self.reject_networked && kind.is_networked() {
            return Ok(BidResponse::reject(format!(
                "networking is not enabled on this node (job requires {kind})"
            )));
        }
        Ok(BidResponse::accept())
    }
}

/// Declines jobs that could never fit the node's total capacity.
///
/// Transient shortage is handled by the capacity tracker at accept time;
/// this strategy rejects asks the node could not satisfy even when idle.
#[derive(Debug, Clone, Copy)]
pub struct ResourceCapacityStrategy {
    max: Resources,
}

impl ResourceCapacityStrategy {
    /// Creates the strategy for a node with the given total capacity.
    #[must_use]
    pub const fn new(max: Resources) -> Self {
        Self { max }
    }
}

impl BidStrategy for ResourceCapacityStrategy {
    fn should_bid(&self, request: &BidRequest) -> Result<BidResponse> {
        let needed = request.job.task().resources;
        if !needed.fits(&self.max) {
            return Ok(BidResponse::reject(format!(
                "job needs {needed:?} but the node's total capacity is {:?}",
                self.max
            )));
        }
        Ok(BidResponse::accept())
    }
}

/// Runs strategies in order; the first rejection wins.
#[derive(Clone, Default)]
pub struct ChainedBidStrategy {
    strategies: Vec<Arc<dyn BidStrategy>>,
}

impl ChainedBidStrategy {
    /// Creates an empty chain, which accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a strategy to the chain.
    #[must_use]
    pub fn with(mut self, strategy: Arc<dyn BidStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }
}

impl BidStrategy for ChainedBidStrategy {
    fn should_bid(&self, request: &BidRequest) -> Result<BidResponse> {
        for strategy in &self.strategies {
            let response = strategy.should_bid(request)?;
            if !response.should_bid {
                return Ok(response);
            }
        }
        Ok(BidResponse::accept())
    }
}
