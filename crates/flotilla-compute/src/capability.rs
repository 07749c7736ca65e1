//! Capability contracts and their registry.
//!
//! Engines, storages and publishers are pluggable capabilities identified by
//! kind. The core never interprets their parameters; it routes each
//! [`flotilla_core::spec_config::SpecConfig`] to the matching entry in a
//! [`Provider`] registry. Registries are built at node startup — no dynamic
//! loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use flotilla_core::error::{Error, Result};
use flotilla_core::execution::{Execution, RunResult};
use flotilla_core::id::{ExecutionId, JobId};
use flotilla_core::job::InputSource;
use flotilla_core::network::{NetworkConfig, PortMap};
use flotilla_core::resources::Resources;
use flotilla_core::spec_config::SpecConfig;

use crate::config::OutputLimits;

/// Errors an executor backend distinguishes for the runner.
///
/// The advisory variants are not failures: a duplicate start falls through
/// to waiting on the original, and cancelling twice is a no-op.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The execution was already started; callers fall through to `wait`.
    #[error("execution already started")]
    AlreadyStarted,
    /// The execution was already cancelled.
    #[error("execution already cancelled")]
    AlreadyCancelled,
    /// The backend has no record of the execution.
    #[error("execution not found in backend")]
    NotFound,
    /// The attempt failed.
    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    /// Returns true if the error is advisory rather than a failure.
    #[must_use]
    pub const fn is_advisory(&self) -> bool {
        matches!(self, Self::AlreadyStarted | Self::AlreadyCancelled)
    }
}

/// Everything a backend needs to run one execution.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// The job being run.
    pub job_id: JobId,
    /// The execution this run belongs to.
    pub execution_id: ExecutionId,
    /// Resources allocated to the run.
    pub resources: Resources,
    /// Network attachment, with the default kind already resolved.
    pub network: NetworkConfig,
    /// Host ports allocated for the task's container ports.
    pub ports: PortMap,
    /// Result paths to collect, relative to the results directory.
    pub outputs: Vec<String>,
    /// Staged input volumes.
    pub inputs: Vec<PreparedStorage>,
    /// The execution's scratch directory.
    pub execution_dir: PathBuf,
    /// The engine spec, opaque to the core.
    pub engine: SpecConfig,
    /// Resolved environment variables.
    pub env: HashMap<String, String>,
    /// Byte caps on stdout/stderr capture and return.
    pub output_limits: OutputLimits,
}

/// Runs executions to completion.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Starts the run described by `spec`.
    ///
    /// # Errors
    ///
    /// [`BackendError::AlreadyStarted`] when the execution is already
    /// running (advisory); anything else fails the attempt.
    async fn start(&self, spec: RunSpec) -> std::result::Result<(), BackendError>;

    /// Waits for a started run to finish and returns its captured output.
    ///
    /// Cancellation of the orchestrator-side wait does not stop the run;
    /// use [`ExecutorBackend::cancel`].
    ///
    /// # Errors
    ///
    /// [`BackendError::NotFound`] when the execution was never started.
    async fn wait(&self, execution_id: ExecutionId) -> std::result::Result<RunResult, BackendError>;

    /// Stops a running execution.
    ///
    /// # Errors
    ///
    /// [`BackendError::AlreadyCancelled`] when it is already stopped
    /// (advisory).
    async fn cancel(&self, execution_id: ExecutionId) -> std::result::Result<(), BackendError>;

    /// Returns true if the backend's runtime is present on this node.
    fn is_installed(&self) -> bool {
        true
    }
}

/// A staged input volume.
#[derive(Debug, Clone)]
pub struct PreparedStorage {
    /// The input this volume stages.
    pub input: InputSource,
    /// Where the data was staged on the node.
    pub volume_path: PathBuf,
}

/// Stages input data onto the node.
#[async_trait]
pub trait StorageMount: Send + Sync {
    /// Returns true if the source is already present locally.
    async fn has_resource_locally(&self, source: &SpecConfig) -> Result<bool>;

    /// Stages `input` under `staging_dir` for the given execution.
    async fn prepare(
        &self,
        execution_id: ExecutionId,
        input: &InputSource,
        staging_dir: &Path,
    ) -> Result<PreparedStorage>;

    /// Removes a staged volume.
    async fn clean(&self, prepared: &PreparedStorage) -> Result<()>;

    /// Returns true if the storage client is usable on this node.
    fn is_installed(&self) -> bool {
        true
    }
}

/// Publishes a results directory and returns its artifact descriptor.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    /// Publishes `results_dir` for the execution, returning where the
    /// artifact landed.
    async fn publish_result(
        &self,
        execution: &Execution,
        results_dir: &Path,
    ) -> Result<SpecConfig>;
}

/// A registry of capability implementations keyed by kind.
///
/// Lookups are case-insensitive, matching
/// [`SpecConfig::is_kind`](flotilla_core::spec_config::SpecConfig::is_kind).
pub struct Provider<T: ?Sized> {
    entries: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Default for Provider<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: ?Sized> Provider<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an implementation for a kind, replacing any previous one.
    #[must_use]
    pub fn with(mut self, kind: impl Into<String>, entry: Arc<T>) -> Self {
        self.entries.insert(kind.into().to_ascii_lowercase(), entry);
        self
    }

    /// Returns the implementation for a kind.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unregistered kinds.
    pub fn get(&self, kind: &str) -> Result<Arc<T>> {
        self.entries
            .get(&kind.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::not_found("capability", kind))
    }

    /// The registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.entries.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_lookup_is_case_insensitive() {
        let provider: Provider<str> = Provider::new().with("Docker", Arc::from("docker-impl"));
        assert!(provider.get("docker").is_ok());
        assert!(provider.get(" DOCKER ").is_ok());
        assert!(provider.get("wasm").is_err());
        assert_eq!(provider.kinds(), vec!["docker".to_string()]);
    }

    #[test]
    fn advisory_errors_are_not_failures() {
        assert!(BackendError::AlreadyStarted.is_advisory());
        assert!(BackendError::AlreadyCancelled.is_advisory());
        assert!(!BackendError::NotFound.is_advisory());
        assert!(!BackendError::Failed("boom".into()).is_advisory());
    }
}
