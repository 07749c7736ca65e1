//! Append-only event streams for jobs and executions.
//!
//! Events are the user-visible history of a job: every noteworthy transition
//! appends one to the job's or execution's stream with a strictly increasing
//! per-stream sequence number (assigned by the store on append).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ErrorCode;

/// Well-known event topics.
pub mod topics {
    /// The job was submitted.
    pub const JOB_SUBMITTED: &str = "Submitted";
    /// The scheduler queued the job waiting for capacity.
    pub const JOB_QUEUED: &str = "Queued";
    /// The job gave up permanently.
    pub const JOB_FAILED: &str = "JobFailed";
    /// The execution was created by the planner.
    pub const EXEC_CREATED: &str = "ExecutionCreated";
    /// The node offered a bid.
    pub const EXEC_BID_OFFERED: &str = "BidOffered";
    /// The node declined to bid.
    pub const EXEC_BID_DECLINED: &str = "BidDeclined";
    /// The orchestrator accepted the bid.
    pub const EXEC_BID_ACCEPTED: &str = "BidAccepted";
    /// The orchestrator withdrew the bid.
    pub const EXEC_BID_REJECTED: &str = "BidRejected";
    /// The task started running.
    pub const EXEC_RUNNING: &str = "ExecutionRunning";
    /// Results are being published.
    pub const EXEC_PUBLISHING: &str = "ExecutionPublishing";
    /// The execution completed.
    pub const EXEC_COMPLETED: &str = "ExecutionCompleted";
    /// The execution failed.
    pub const EXEC_FAILED: &str = "ExecutionFailed";
    /// The execution was cancelled.
    pub const EXEC_CANCELLED: &str = "ExecutionCancelled";
    /// The execution ran past its timeout.
    pub const EXEC_TIMED_OUT: &str = "ExecutionTimedOut";
    /// The execution's node was lost.
    pub const EXEC_NODE_LOST: &str = "NodeLost";
}

/// One record in a job's or execution's history stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Strictly increasing per-stream sequence number; zero until appended.
    #[serde(default)]
    pub seq: u64,
    /// What kind of thing happened; one of the [`topics`] constants.
    pub topic: String,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Human-readable description.
    pub message: String,
    /// Error classification, for failure events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Additional structured detail.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl Event {
    /// Creates an event on a topic with no message.
    #[must_use]
    pub fn new(topic: &str) -> Self {
        Self {
            seq: 0,
            topic: topic.to_string(),
            timestamp: Utc::now(),
            message: String::new(),
            error_code: None,
            details: BTreeMap::new(),
        }
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Records an error's message and code on the event.
    #[must_use]
    pub fn with_error(mut self, error: &crate::error::Error) -> Self {
        self.message = error.to_string();
        self.error_code = Some(error.code());
        self
    }

    /// Adds a structured detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
