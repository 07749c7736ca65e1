//! Retry policy for failed executions.
//!
//! Consulted by schedulers when an execution fails or its node is lost.
//! Approving a retry links the failed execution to its replacement; denying
//! one surfaces the failure on the evaluation.

use flotilla_core::id::JobId;

/// Default number of placement attempts per partition.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What the scheduler knows when asking whether to retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryRequest {
    /// The job whose execution failed.
    pub job_id: JobId,
    /// How many executions of this partition have already failed.
    pub attempts: u32,
}

/// Decides whether a failed execution gets a replacement.
pub trait RetryStrategy: Send + Sync {
    /// Returns true if the partition should be retried.
    fn should_retry(&self, request: &RetryRequest) -> bool;
}

/// Retries until a fixed number of failed attempts is reached.
#[derive(Debug, Clone, Copy)]
pub struct AttemptCountStrategy {
    max_attempts: u32,
}

impl AttemptCountStrategy {
    /// Creates a strategy allowing `max_attempts` failed attempts per
    /// partition.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl Default for AttemptCountStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryStrategy for AttemptCountStrategy {
    fn should_retry(&self, request: &RetryRequest) -> bool {
        request.attempts < self.max_attempts
    }
}

/// Never retries; service for tests and fail-fast deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryStrategy;

impl RetryStrategy for NoRetryStrategy {
    fn should_retry(&self, _request: &RetryRequest) -> bool {
        false
    }
}
