//  REPOSITORY.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the in-memory [`JobRepository`], which is the store the
//!   host runs with out of the box. Jobs live in a concurrent map; the
//!   idempotency index is a second map from key to live job id.
//

use async_trait::async_trait;
use dashmap::DashMap;
use specifications::jobs::{Job, JobStatus};

use crate::errors::RepositoryError;
use crate::spec::JobRepository;


/***** LIBRARY *****/
/// The in-memory job store.
#[derive(Debug, Default)]
pub struct MemJobRepository {
    /// All jobs, keyed by job id.
    jobs: DashMap<String, Job>,
    /// The idempotency index: key -> live job id.
    keys: DashMap<String, String>,
}
impl MemJobRepository {
    /// Constructor for an empty MemJobRepository.
    #[inline]
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl JobRepository for MemJobRepository {
    async fn insert(&self, job: Job) -> Result<(), RepositoryError> {
        self.keys.insert(job.request.effective_key().to_string(), job.id().to_string());
        self.jobs.insert(job.id().to_string(), job);
        Ok(())
    }

    async fn save(&self, job: Job) -> Result<(), RepositoryError> {
        self.jobs.insert(job.id().to_string(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, RepositoryError> { Ok(self.jobs.get(id).map(|job| job.clone())) }

    async fn get_by_key(&self, key: &str) -> Result<Option<Job>, RepositoryError> {
        let id: String = match self.keys.get(key) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        Ok(self.jobs.get(&id).map(|job| job.clone()))
    }

    async fn claim_key(&self, key: &str, job_id: &str) -> Result<(), RepositoryError> {
        self.keys.insert(key.to_string(), job_id.to_string());
        Ok(())
    }

    async fn release_key(&self, key: &str) -> Result<(), RepositoryError> {
        self.keys.remove(key);
        Ok(())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, RepositoryError> {
        Ok(self.jobs.iter().filter(|entry| entry.status == status).map(|entry| entry.clone()).collect())
    }

    async fn list_by_agent(&self, agent_id: &str) -> Result<Vec<Job>, RepositoryError> {
        Ok(self.jobs.iter().filter(|entry| entry.assigned_agent_id.as_deref() == Some(agent_id)).map(|entry| entry.clone()).collect())
    }

    async fn list(&self) -> Result<Vec<Job>, RepositoryError> { Ok(self.jobs.iter().map(|entry| entry.clone()).collect()) }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use specifications::jobs::JobRequest;

    use super::*;

    #[tokio::test]
    async fn test_key_index_tracks_live_job() {
        let repo: MemJobRepository = MemJobRepository::new();
        let mut request: JobRequest = JobRequest::new("echo");
        request.idempotency_key = Some("k1".into());
        let job: Job = Job::new(request);
        let id: String = job.id().to_string();

        repo.insert(job).await.unwrap();
        assert_eq!(repo.get_by_key("k1").await.unwrap().unwrap().id(), id);

        repo.release_key("k1").await.unwrap();
        assert!(repo.get_by_key("k1").await.unwrap().is_none());
        // The job itself is retained for audit
        assert!(repo.get(&id).await.unwrap().is_some());

        repo.claim_key("k1", &id).await.unwrap();
        assert_eq!(repo.get_by_key("k1").await.unwrap().unwrap().id(), id);
    }
}
