//! Execution scratch and results directories.
//!
//! Each execution gets a scratch directory under the node's results root,
//! with a `results` subdirectory the task writes outputs into. Scratch
//! directories outlive the execution by a configured delay so operators can
//! inspect fresh failures, then a background task removes them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use flotilla_core::error::{Error, Result};
use flotilla_core::id::ExecutionId;

/// Name of the per-execution subdirectory tasks write results into.
const RESULTS_SUBDIR: &str = "results";
/// Name of the per-execution subdirectory inputs are staged into.
const INPUTS_SUBDIR: &str = "inputs";

/// Layout of execution directories under one results root.
#[derive(Debug, Clone)]
pub struct ResultsPath {
    root: PathBuf,
}

impl ResultsPath {
    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The scratch directory of an execution.
    #[must_use]
    pub fn execution_output_dir(&self, execution_id: ExecutionId) -> PathBuf {
        self.root.join(execution_id.to_string())
    }

    /// The directory a task writes results into.
    #[must_use]
    pub fn execution_results_dir(&self, execution_id: ExecutionId) -> PathBuf {
        self.execution_output_dir(execution_id).join(RESULTS_SUBDIR)
    }

    /// The directory inputs are staged into.
    #[must_use]
    pub fn execution_inputs_dir(&self, execution_id: ExecutionId) -> PathBuf {
        self.execution_output_dir(execution_id).join(INPUTS_SUBDIR)
    }

    /// Creates the execution's scratch, results and inputs directories.
    ///
    /// # Errors
    ///
    /// Returns a datastore error when the directories cannot be created.
    pub async fn prepare_execution_output_dir(
        &self,
        execution_id: ExecutionId,
    ) -> Result<PathBuf> {
        let dir = self.execution_output_dir(execution_id);
        for subdir in [RESULTS_SUBDIR, INPUTS_SUBDIR] {
            tokio::fs::create_dir_all(dir.join(subdir))
                .await
                .map_err(|e| {
                    Error::datastore_with_source(
                        format!("creating execution directory {}", dir.display()),
                        e,
                    )
                })?;
        }
        Ok(dir)
    }

    /// Schedules removal of the execution's scratch directory after `delay`.
    ///
    /// Best effort: failures are logged, not surfaced.
    pub fn schedule_root_cleanup(&self, execution_id: ExecutionId, delay: Duration) {
        let dir = self.execution_output_dir(execution_id);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            remove_dir_logged(&dir).await;
        });
    }
}

async fn remove_dir_logged(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(path = %dir.display(), "removed execution scratch directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove execution scratch directory");
        }
    }
}
