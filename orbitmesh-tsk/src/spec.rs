//  SPEC.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the public interfaces of the job stack: the repository trait
//!   behind which persistent stores hide, and the events the job manager
//!   publishes for dashboards and workflow steps.
//

use async_trait::async_trait;
use specifications::jobs::{Job, JobProgress, JobResult, JobStatus};

use crate::errors::RepositoryError;


/***** LIBRARY *****/
/// The events the job manager publishes to interested observers.
#[derive(Clone, Debug)]
pub enum JobEvent {
    /// A new job entered the queue.
    Created { job: Job },
    /// A job's lifecycle status changed.
    StatusChanged { job_id: String, old: JobStatus, new: JobStatus },
    /// A progress report arrived for a job.
    Progress(JobProgress),
    /// A job completed successfully.
    Completed { job_id: String, result: JobResult },
    /// A job failed terminally (retries exhausted).
    Failed { job_id: String, error: String },
    /// A job was parked in the dead-letter store.
    DeadLettered { entry_id: String, job_id: String, reason: String },
}



/// The storage seam for Job records. The host ships an in-memory implementation; persistent
/// backends implement the same trait.
///
/// The repository is a dumb store: all transition legality and locking is the job manager's
/// business. The one piece of logic it owns is the idempotency index, which maps each
/// idempotency key to at most one live job at any time.
#[async_trait]
pub trait JobRepository: 'static + Send + Sync + std::fmt::Debug {
    /// Stores a new job and claims its idempotency key.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn insert(&self, job: Job) -> Result<(), RepositoryError>;

    /// Updates an existing job in place (keyed by its id).
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn save(&self, job: Job) -> Result<(), RepositoryError>;

    /// Retrieves a job by id.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn get(&self, id: &str) -> Result<Option<Job>, RepositoryError>;

    /// Retrieves the job currently claiming the given idempotency key, if any.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn get_by_key(&self, key: &str) -> Result<Option<Job>, RepositoryError>;

    /// Re-claims the given idempotency key for the given job (used when a dead-lettered job is
    /// retried).
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn claim_key(&self, key: &str, job_id: &str) -> Result<(), RepositoryError>;

    /// Releases the given idempotency key (used when a job terminates for good).
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn release_key(&self, key: &str) -> Result<(), RepositoryError>;

    /// Lists all jobs with the given status.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError>;

    /// Lists all jobs assigned to the given agent.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<Job>, RepositoryError>;

    /// Lists every stored job.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn list(&self) -> Result<Vec<Job>, RepositoryError>;
}
