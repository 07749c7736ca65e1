//! Jobs and tasks.
//!
//! A [`Job`] is the immutable user-submitted descriptor of work; a [`Task`]
//! is its engine spec plus the inputs, outputs, resources and limits the
//! engine runs under. Jobs are immutable by convention: the orchestrator
//! replaces a job wholesale (bumping `version`) rather than mutating fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::id::JobId;
use crate::network::NetworkConfig;
use crate::resources::Resources;
use crate::selector::Selector;
use crate::spec_config::SpecConfig;

/// The scheduling policy family a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Runs each partition to completion once.
    Batch,
    /// Keeps each partition running, restarting on failure.
    Service,
    /// Runs on every eligible node, continuously.
    Daemon,
    /// Runs on every eligible node to completion.
    Ops,
}

impl JobType {
    /// All job types, in scheduling-family order.
    pub const ALL: [Self; 4] = [Self::Batch, Self::Service, Self::Daemon, Self::Ops];

    /// Returns true if the job places one execution per partition index
    /// rather than one per eligible node.
    #[must_use]
    pub const fn is_partitioned(&self) -> bool {
        matches!(self, Self::Batch | Self::Service)
    }

    /// Returns true if a completed execution fulfils its partition for good.
    #[must_use]
    pub const fn completion_is_terminal(&self) -> bool {
        matches!(self, Self::Batch | Self::Ops)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Batch => "batch",
            Self::Service => "service",
            Self::Daemon => "daemon",
            Self::Ops => "ops",
        };
        write!(f, "{s}")
    }
}

/// Default negotiation (bidding) timeout.
const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 3 * 60;
/// Default execution timeout.
const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30 * 60;

/// Time bounds on the phases of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTimeouts {
    /// Bound on the running phase of the task.
    pub execution: Duration,
    /// Bound on the bid-ask handshake.
    pub negotiation: Duration,
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self {
            execution: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
            negotiation: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS),
        }
    }
}

/// A storage source to stage before the task starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSource {
    /// Where the data comes from, routed to a storage provider by kind.
    pub source: SpecConfig,
    /// The path the task expects the data at.
    pub target: String,
}

/// The engine spec and execution envelope of a unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// The task name, unique within its job.
    pub name: String,
    /// The engine that runs the task, opaque to the core.
    pub engine: SpecConfig,
    /// Storage to stage before the task starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_sources: Vec<InputSource>,
    /// Paths inside the execution directory collected as results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result_paths: Vec<String>,
    /// Where results are published; empty for none.
    #[serde(default)]
    pub publisher: SpecConfig,
    /// Resources the task needs.
    pub resources: Resources,
    /// Network attachment.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Phase time bounds.
    #[serde(default)]
    pub timeouts: TaskTimeouts,
    /// Environment variables the task may receive, name to value. Names
    /// outside the compute node's allow-list policy are rejected at run
    /// time.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl Task {
    /// Creates a task with the given name and engine.
    #[must_use]
    pub fn new(name: impl Into<String>, engine: SpecConfig) -> Self {
        Self {
            name: name.into(),
            engine,
            ..Self::default()
        }
    }

    /// Returns true if the task has a publisher configured.
    #[must_use]
    pub fn has_publisher(&self) -> bool {
        !self.publisher.is_empty()
    }

    /// Validates the task spec.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the name is blank, the engine spec is
    /// invalid, or an input source is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("task name must not be blank"));
        }
        self.engine.validate()?;
        self.publisher.validate_allow_empty()?;
        for input in &self.input_sources {
            input.source.validate()?;
            if input.target.trim().is_empty() {
                return Err(Error::validation(format!(
                    "input source '{}' has a blank target path",
                    input.source.kind
                )));
            }
        }
        Ok(())
    }
}

/// A user-submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// The job's unique ID.
    pub id: JobId,
    /// Human-readable name; (namespace, name) is unique.
    pub name: String,
    /// The namespace tag the job lives under.
    pub namespace: String,
    /// The scheduling policy family.
    pub job_type: JobType,
    /// Number of partitions (replicas) to place, at least one.
    pub count: u32,
    /// Scheduling priority; higher dequeues first.
    pub priority: i64,
    /// The job's tasks, in order. The schedulers treat exactly one.
    pub tasks: Vec<Task>,
    /// Label constraints nodes must satisfy.
    #[serde(default, skip_serializing_if = "Selector::is_empty")]
    pub constraints: Selector,
    /// When the job was submitted.
    pub create_time: DateTime<Utc>,
    /// When the job was last replaced.
    pub modify_time: DateTime<Utc>,
    /// Monotone per-ID version, bumped on every replacement.
    pub version: u64,
}

impl Job {
    /// Creates a single-task job with defaults suitable for submission.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        job_type: JobType,
        task: Task,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            name: name.into(),
            namespace: namespace.into(),
            job_type,
            count: 1,
            priority: 0,
            tasks: vec![task],
            constraints: Selector::empty(),
            create_time: now,
            modify_time: now,
            version: 1,
        }
    }

    /// Sets the partition count.
    #[must_use]
    pub const fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the placement constraints.
    #[must_use]
    pub fn with_constraints(mut self, constraints: Selector) -> Self {
        self.constraints = constraints;
        self
    }

    /// Returns the job's single task.
    ///
    /// The hard scheduling problems treat exactly one task per job; the
    /// list-shaped field keeps multi-task jobs representable.
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.tasks[0]
    }

    /// Validates the job spec.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the name or namespace is blank, the
    /// count is zero, the job has no tasks, or a task is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("job name must not be blank"));
        }
        if self.name.contains(char::is_whitespace) {
            return Err(Error::validation("job name must not contain whitespace"));
        }
        if self.namespace.trim().is_empty() {
            return Err(Error::validation("job must be in a namespace"));
        }
        if self.count == 0 {
            return Err(Error::validation("job count must be at least 1"));
        }
        if self.tasks.is_empty() {
            return Err(Error::validation("job must have at least one task"));
        }
        for task in &self.tasks {
            task.validate()?;
        }
        Ok(())
    }
}
