//! Orchestrator-local registries for jobs and evaluations.
//!
//! The execution store is the durable coordination point with compute nodes;
//! jobs and evaluations are owned exclusively by the orchestrator and held in
//! these process-local sets. On restart the broker is reconciled from
//! [`EvaluationSet::pending`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use flotilla_core::error::{Error, Result};
use flotilla_core::evaluation::{EvalStatus, Evaluation};
use flotilla_core::id::{EvalId, JobId};
use flotilla_core::job::Job;

/// Converts a lock poison error to a datastore error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::datastore("orchestrator state lock poisoned")
}

/// The set of jobs the orchestrator knows about.
///
/// Enforces the (namespace, name) uniqueness invariant on insert.
#[derive(Debug, Default)]
pub struct JobSet {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl JobSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and inserts a job.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the job is malformed or another job
    /// already holds the same (namespace, name).
    pub fn insert(&self, job: Job) -> Result<()> {
        job.validate()?;
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        if jobs
            .values()
            .any(|j| j.id != job.id && j.namespace == job.namespace && j.name == job.name)
        {
            return Err(Error::validation(format!(
                "job '{}' already exists in namespace '{}'",
                job.name, job.namespace
            )));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    /// Gets a job by ID.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the job is unknown.
    pub fn get(&self, id: &JobId) -> Result<Job> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// Returns the number of jobs in the set.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        Ok(jobs.len())
    }

    /// Returns true if the set holds no jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// The set of evaluations the orchestrator has created, with their statuses.
#[derive(Debug, Default)]
pub struct EvaluationSet {
    evaluations: RwLock<HashMap<EvalId, Evaluation>>,
}

impl EvaluationSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an evaluation.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert(&self, evaluation: Evaluation) -> Result<()> {
        let mut evaluations = self.evaluations.write().map_err(poison_err)?;
        evaluations.insert(evaluation.id, evaluation);
        Ok(())
    }

    /// Gets an evaluation by ID.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the evaluation is unknown.
    pub fn get(&self, id: &EvalId) -> Result<Evaluation> {
        let evaluations = self.evaluations.read().map_err(poison_err)?;
        evaluations
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("evaluation", id))
    }

    /// Updates an evaluation's status.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the evaluation is unknown.
    pub fn update_status(
        &self,
        id: &EvalId,
        status: EvalStatus,
        description: Option<String>,
    ) -> Result<()> {
        let mut evaluations = self.evaluations.write().map_err(poison_err)?;
        let evaluation = evaluations
            .get_mut(id)
            .ok_or_else(|| Error::not_found("evaluation", id))?;
        evaluation.status = status;
        evaluation.status_description = description;
        Ok(())
    }

    /// Returns all evaluations still pending, for broker reconciliation at
    /// boot.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending(&self) -> Result<Vec<Evaluation>> {
        let evaluations = self.evaluations.read().map_err(poison_err)?;
        Ok(evaluations
            .values()
            .filter(|e| e.status == EvalStatus::Pending)
            .cloned()
            .collect())
    }
}
