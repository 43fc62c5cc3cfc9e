//  REPOSITORY.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the storage seams for workflow definitions and instances,
//!   plus the in-memory implementations the host runs with by default.
//!   Definitions are versioned: storing an existing (id, version) pair is
//!   a conflict, never an overwrite.
//

use async_trait::async_trait;
use dashmap::DashMap;
use semver::Version;

pub use crate::errors::WorkflowRepoError as Error;
use crate::instance::WorkflowInstance;
use crate::workflow::WorkflowDefinition;


/***** LIBRARY *****/
/// The storage seam for workflow definitions.
#[async_trait]
pub trait WorkflowRepository: 'static + Send + Sync + std::fmt::Debug {
    /// Stores a new definition version.
    ///
    /// # Errors
    /// This function errors with [`Error::VersionConflict`] if the (id, version) pair exists.
    async fn store(&self, definition: WorkflowDefinition) -> Result<(), Error>;

    /// Retrieves a specific version, or the latest when `version` is None.
    ///
    /// # Errors
    /// This function errors if the workflow (or version) is unknown.
    async fn get(&self, id: &str, version: Option<&str>) -> Result<WorkflowDefinition, Error>;

    /// Lists the latest version of every stored workflow.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn list(&self) -> Result<Vec<WorkflowDefinition>, Error>;

    /// Flips the active flag of every version of the given workflow.
    ///
    /// # Errors
    /// This function errors if the workflow is unknown.
    async fn set_active(&self, id: &str, active: bool) -> Result<(), Error>;

    /// Removes every version of the given workflow.
    ///
    /// # Errors
    /// This function errors if the workflow is unknown.
    async fn remove(&self, id: &str) -> Result<(), Error>;
}

/// The storage seam for workflow instances.
#[async_trait]
pub trait InstanceRepository: 'static + Send + Sync + std::fmt::Debug {
    /// Stores or updates an instance snapshot.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn save(&self, instance: WorkflowInstance) -> Result<(), Error>;

    /// Retrieves an instance by id.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn get(&self, id: &str) -> Result<Option<WorkflowInstance>, Error>;

    /// Lists instances, optionally filtered by workflow id.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn list(&self, workflow_id: Option<&str>) -> Result<Vec<WorkflowInstance>, Error>;

    /// Lists all non-terminal instances.
    ///
    /// # Errors
    /// This function errors if the backing store fails.
    async fn list_live(&self) -> Result<Vec<WorkflowInstance>, Error>;
}



/// The in-memory definition store. Keyed by workflow id, each holding its versions.
#[derive(Debug, Default)]
pub struct MemWorkflowRepository {
    /// Workflow id -> version string -> definition.
    workflows: DashMap<String, Vec<WorkflowDefinition>>,
}
impl MemWorkflowRepository {
    /// Constructor for an empty MemWorkflowRepository.
    #[inline]
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl WorkflowRepository for MemWorkflowRepository {
    async fn store(&self, definition: WorkflowDefinition) -> Result<(), Error> {
        let mut versions = self.workflows.entry(definition.id.clone()).or_default();
        if versions.iter().any(|existing| existing.version == definition.version) {
            return Err(Error::VersionConflict { id: definition.id.clone(), version: definition.version.clone() });
        }
        versions.push(definition);
        Ok(())
    }

    async fn get(&self, id: &str, version: Option<&str>) -> Result<WorkflowDefinition, Error> {
        let versions = match self.workflows.get(id) {
            Some(versions) => versions,
            None => {
                return Err(Error::UnknownWorkflow { id: id.into(), version: version.map(String::from) });
            },
        };

        match version {
            Some(version) => versions
                .iter()
                .find(|definition| definition.version == version)
                .cloned()
                .ok_or_else(|| Error::UnknownWorkflow { id: id.into(), version: Some(version.into()) }),
            None => versions
                .iter()
                .max_by_key(|definition| Version::parse(&definition.version).unwrap_or_else(|_| Version::new(0, 0, 0)))
                .cloned()
                .ok_or_else(|| Error::UnknownWorkflow { id: id.into(), version: None }),
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>, Error> {
        let mut latest: Vec<WorkflowDefinition> = Vec::with_capacity(self.workflows.len());
        for entry in self.workflows.iter() {
            if let Some(definition) =
                entry.iter().max_by_key(|definition| Version::parse(&definition.version).unwrap_or_else(|_| Version::new(0, 0, 0)))
            {
                latest.push(definition.clone());
            }
        }
        latest.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        Ok(latest)
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<(), Error> {
        let mut versions = match self.workflows.get_mut(id) {
            Some(versions) => versions,
            None => {
                return Err(Error::UnknownWorkflow { id: id.into(), version: None });
            },
        };
        for definition in versions.iter_mut() {
            definition.is_active = active;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), Error> {
        match self.workflows.remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownWorkflow { id: id.into(), version: None }),
        }
    }
}



/// The in-memory instance store.
#[derive(Debug, Default)]
pub struct MemInstanceRepository {
    /// All instances, keyed by instance id.
    instances: DashMap<String, WorkflowInstance>,
}
impl MemInstanceRepository {
    /// Constructor for an empty MemInstanceRepository.
    #[inline]
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl InstanceRepository for MemInstanceRepository {
    async fn save(&self, instance: WorkflowInstance) -> Result<(), Error> {
        self.instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<WorkflowInstance>, Error> { Ok(self.instances.get(id).map(|instance| instance.clone())) }

    async fn list(&self, workflow_id: Option<&str>) -> Result<Vec<WorkflowInstance>, Error> {
        let mut instances: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|instance| workflow_id.map(|id| instance.workflow_id == id).unwrap_or(true))
            .map(|instance| instance.clone())
            .collect();
        instances.sort_by(|lhs, rhs| rhs.created_at.cmp(&lhs.created_at));
        Ok(instances)
    }

    async fn list_live(&self) -> Result<Vec<WorkflowInstance>, Error> {
        Ok(self.instances.iter().filter(|instance| !instance.is_terminal()).map(|instance| instance.clone()).collect())
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::instance::WorkflowInstance;
    use crate::workflow::{ErrorStrategy, StepConfig, WorkflowStep};

    use super::*;

    /// Builds a minimal definition with the given version.
    fn definition(version: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            name: "Test".into(),
            version: version.into(),
            description: String::new(),
            steps: vec![WorkflowStep::new("s1", StepConfig::Transform { expression: "true".into() })],
            triggers: Vec::new(),
            variables: HashMap::new(),
            timeout: None,
            max_retries: 0,
            error_strategy: ErrorStrategy::StopOnFirst,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_version_conflict_and_latest() {
        let repo: MemWorkflowRepository = MemWorkflowRepository::new();
        repo.store(definition("1.0.0")).await.unwrap();
        repo.store(definition("1.2.0")).await.unwrap();
        repo.store(definition("1.10.0")).await.unwrap();

        // Duplicate versions conflict
        assert!(matches!(repo.store(definition("1.2.0")).await, Err(Error::VersionConflict { .. })));

        // Latest is semver-latest, not lexicographic
        assert_eq!(repo.get("wf", None).await.unwrap().version, "1.10.0");
        assert_eq!(repo.get("wf", Some("1.2.0")).await.unwrap().version, "1.2.0");
        assert!(matches!(repo.get("wf", Some("9.9.9")).await, Err(Error::UnknownWorkflow { .. })));
        assert!(matches!(repo.get("ghost", None).await, Err(Error::UnknownWorkflow { .. })));
    }

    #[tokio::test]
    async fn test_instance_store_filters() {
        let repo: MemInstanceRepository = MemInstanceRepository::new();
        let mut done: WorkflowInstance = WorkflowInstance::new("wf-a", "1.0.0", serde_json::Value::Null);
        done.status = crate::instance::InstanceStatus::Completed;
        let live: WorkflowInstance = WorkflowInstance::new("wf-b", "1.0.0", serde_json::Value::Null);
        repo.save(done).await.unwrap();
        repo.save(live.clone()).await.unwrap();

        assert_eq!(repo.list(None).await.unwrap().len(), 2);
        assert_eq!(repo.list(Some("wf-a")).await.unwrap().len(), 1);
        let live_only: Vec<WorkflowInstance> = repo.list_live().await.unwrap();
        assert_eq!(live_only.len(), 1);
        assert_eq!(live_only[0].id, live.id);
    }
}
