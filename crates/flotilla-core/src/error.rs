//! Error types and result aliases for Flotilla.
//!
//! This module defines the shared error taxonomy used across all Flotilla
//! components. Every error maps to an [`ErrorCode`] for programmatic
//! handling, and [`Error::is_retryable`] tells callers whether backing off
//! and retrying the operation can succeed.

use std::time::Duration;

use crate::execution::ComputeState;
use crate::id::{EvalId, ExecutionId};

/// The result type used throughout Flotilla.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an error, stable across error variants.
///
/// Codes are the unit of programmatic error handling: they survive
/// serialization into events and API envelopes while the variant detail does
/// not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    /// The request was malformed.
    BadRequest,
    /// The request was well-formed but failed domain validation.
    Validation,
    /// The referenced entity does not exist.
    NotFound,
    /// The caller is not authenticated.
    Unauthorized,
    /// The caller is authenticated but not permitted.
    Forbidden,
    /// A precondition or uniqueness constraint failed.
    Conflict,
    /// The operation exceeded its time bound.
    Timeout,
    /// A network hop failed.
    NetworkFailure,
    /// A dependency is temporarily unavailable.
    ServiceUnavailable,
    /// The backing datastore failed.
    DatastoreFailure,
    /// An invariant was violated; not expected in normal operation.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BadRequest => "BadRequest",
            Self::Validation => "Validation",
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::Conflict => "Conflict",
            Self::Timeout => "Timeout",
            Self::NetworkFailure => "NetworkFailure",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::DatastoreFailure => "DatastoreFailure",
            Self::Internal => "Internal",
        };
        write!(f, "{s}")
    }
}

/// Errors that can occur in Flotilla operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// The request was malformed.
    #[error("bad request: {message}")]
    BadRequest {
        /// Description of the problem.
        message: String,
    },

    /// Domain validation failed.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the failed validation.
        message: String,
    },

    /// The requested entity was not found.
    #[error("not found: {entity} with id {id}")]
    NotFound {
        /// The type of entity that was not found.
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// An execution with the same ID already exists in the store.
    #[error("execution already exists: {id}")]
    ExecutionAlreadyExists {
        /// The duplicated execution ID.
        id: ExecutionId,
    },

    /// The stored execution is in a terminal compute state and the update
    /// would transition it further.
    #[error("execution {id} already terminal in state {state}")]
    ExecutionAlreadyTerminal {
        /// The execution that refused the update.
        id: ExecutionId,
        /// The terminal compute state it holds.
        state: ComputeState,
    },

    /// A compare-and-set precondition did not match the stored record.
    #[error("update condition failed for execution {id}: {message}")]
    ConditionFailed {
        /// The execution whose precondition failed.
        id: ExecutionId,
        /// Which expectation mismatched, with actual and expected values.
        message: String,
    },

    /// The broker has no record of this evaluation.
    #[error("unknown evaluation: {id}")]
    UnknownEvaluation {
        /// The unrecognised evaluation ID.
        id: EvalId,
    },

    /// The receipt handle does not match the current delivery.
    #[error("receipt handle does not match inflight delivery of evaluation {id}")]
    WrongReceipt {
        /// The evaluation whose handle mismatched.
        id: EvalId,
    },

    /// The evaluation is known but not currently inflight.
    #[error("evaluation {id} is not inflight")]
    NotInflight {
        /// The evaluation that was expected to be inflight.
        id: EvalId,
    },

    /// The evaluation exceeded its delivery budget and was failed.
    #[error("evaluation {id} exceeded max delivery attempts ({deliveries})")]
    MaxDeliveryExceeded {
        /// The evaluation that was dropped.
        id: EvalId,
        /// How many deliveries were attempted.
        deliveries: u32,
    },

    /// A task ran past its execution timeout.
    #[error("execution timed out after {timeout:?}")]
    ExecTimeout {
        /// The configured execution timeout that was exceeded.
        timeout: Duration,
    },

    /// An orchestrator-side wait exceeded its bound.
    #[error("timed out: {message}")]
    Timeout {
        /// Description of the operation that timed out.
        message: String,
    },

    /// A network hop failed.
    #[error("network failure: {message}")]
    NetworkFailure {
        /// Description of the failure.
        message: String,
    },

    /// A dependency is temporarily unavailable.
    #[error("service unavailable: {message}")]
    ServiceUnavailable {
        /// Description of the unavailable dependency.
        message: String,
    },

    /// The backing datastore failed.
    #[error("datastore failure: {message}")]
    Datastore {
        /// Description of the datastore failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Several per-item failures rolled into one, from applying a plan.
    #[error("{failed} of {total} plan items failed: {messages:?}")]
    PlanApply {
        /// How many items failed.
        failed: usize,
        /// How many items the plan carried.
        total: usize,
        /// One message per failed item.
        messages: Vec<String>,
    },

    /// An invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new bad-request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Creates a new datastore error.
    #[must_use]
    pub fn datastore(message: impl Into<String>) -> Self {
        Self::Datastore {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new datastore error with a source cause.
    #[must_use]
    pub fn datastore_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Datastore {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the coarse classification of this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidId { .. } | Self::BadRequest { .. } => ErrorCode::BadRequest,
            Self::Validation { .. } => ErrorCode::Validation,
            Self::NotFound { .. } | Self::UnknownEvaluation { .. } => ErrorCode::NotFound,
            Self::ExecutionAlreadyExists { .. }
            | Self::ExecutionAlreadyTerminal { .. }
            | Self::ConditionFailed { .. }
            | Self::WrongReceipt { .. }
            | Self::NotInflight { .. }
            | Self::MaxDeliveryExceeded { .. } => ErrorCode::Conflict,
            Self::ExecTimeout { .. } | Self::Timeout { .. } => ErrorCode::Timeout,
            Self::NetworkFailure { .. } => ErrorCode::NetworkFailure,
            Self::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            Self::Datastore { .. } => ErrorCode::DatastoreFailure,
            Self::PlanApply { .. } | Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Returns true if backing off and retrying the operation can succeed.
    ///
    /// Transient infrastructure failures are retryable, and so is a partial
    /// plan application — the items that landed stay landed and the retry
    /// reconciles the rest. Precondition conflicts, validation failures and
    /// execution timeouts are not: an execution timeout surfaces as a
    /// `Failed` execution and is handled by the retry strategy, not by
    /// replaying the same call.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        if matches!(self, Self::PlanApply { .. }) {
            return true;
        }
        matches!(
            self.code(),
            ErrorCode::Timeout
                | ErrorCode::NetworkFailure
                | ErrorCode::ServiceUnavailable
                | ErrorCode::DatastoreFailure
        ) && !matches!(self, Self::ExecTimeout { .. })
    }
}
