//  INSTANCE.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines running workflow state: the instance with its mutable
//!   variables and the per-step instances, including branch state for
//!   parallel/foreach steps and nested compensation state.
//

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use enum_debug::EnumDebug;
use serde::{Deserialize, Serialize};
use serde_json::Value;


/***** AUXILLARY *****/
/// The states a workflow instance can be in.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but not yet scheduled.
    Pending,
    /// At least one step is running (or runnable).
    Running,
    /// Terminal: every step wrapped up and the instance succeeded.
    Completed,
    /// Terminal: the instance failed.
    Failed,
    /// Terminal: the instance was cancelled.
    Cancelled,
    /// Terminal: the instance exceeded its timeout.
    TimedOut,
    /// Parked on a wait/approval step.
    Paused,
    /// Running compensations after a failure.
    Compensating,
}
impl InstanceStatus {
    /// Returns whether this status is terminal.
    #[inline]
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut) }
}

/// The states a step instance can be in.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet considered.
    Pending,
    /// Considered, but its dependencies are not terminal yet.
    WaitingForDependencies,
    /// The executor is running.
    Running,
    /// Terminal: succeeded.
    Completed,
    /// Terminal: failed.
    Failed,
    /// Terminal: the condition was false, a dependency failed in continue-on-error mode, or a
    /// wait timed out.
    Skipped,
    /// Terminal: cancelled along with the instance (or by fail-fast siblings).
    Cancelled,
    /// Terminal: the step exceeded its own timeout.
    TimedOut,
    /// Parked until a matching event arrives.
    WaitingForEvent,
    /// Parked until enough approvals arrive.
    WaitingForApproval,
    /// The step's compensation is running.
    Compensating,
    /// The step's compensation completed.
    Compensated,
}
impl StepStatus {
    /// Returns whether this status is terminal (nothing will run for this step anymore).
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled | Self::TimedOut | Self::Compensated)
    }

    /// Returns whether a dependency in this status releases its dependents.
    #[inline]
    pub fn satisfies_dependents(&self) -> bool { matches!(self, Self::Completed | Self::Skipped | Self::Compensated) }

    /// Returns whether the step is parked waiting for an external signal.
    #[inline]
    pub fn is_waiting(&self) -> bool { matches!(self, Self::WaitingForEvent | Self::WaitingForApproval) }
}





/***** LIBRARY *****/
/// One branch of a parallel or foreach step.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BranchInstance {
    /// The branch's positional index.
    pub index: usize,
    /// The step instances of this branch, keyed by step id.
    pub steps: HashMap<String, StepInstance>,
    /// The branch's aggregate output, if it completed.
    #[serde(default)]
    pub output: Option<Value>,
}

/// The tracked state of one step of a running instance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StepInstance {
    /// The id of the step this state belongs to.
    pub step_id: String,
    /// Current status.
    pub status: StepStatus,
    /// When the executor started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// The step's output, once completed.
    #[serde(default)]
    pub output: Option<Value>,
    /// The error that failed the step, if any.
    #[serde(default)]
    pub error: Option<String>,
    /// How often the step was retried.
    #[serde(default)]
    pub retry_count: u32,
    /// The job dispatched by a job step.
    #[serde(default)]
    pub job_id: Option<String>,
    /// The child instance launched by a sub-workflow step.
    #[serde(default)]
    pub sub_workflow_instance_id: Option<String>,
    /// Branch state of parallel/foreach steps.
    #[serde(default)]
    pub branches: Vec<BranchInstance>,
    /// Compensation state, once compensation ran.
    #[serde(default)]
    pub compensation: Option<Box<StepInstance>>,
}
impl StepInstance {
    /// Creates fresh pending state for the given step id.
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            retry_count: 0,
            job_id: None,
            sub_workflow_instance_id: None,
            branches: Vec::new(),
            compensation: None,
        }
    }
}



/// One run of a workflow definition.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkflowInstance {
    /// Unique id of this instance.
    pub id: String,
    /// The workflow definition this instance runs.
    pub workflow_id: String,
    /// The definition version it was started against.
    pub workflow_version: String,
    /// Current status.
    pub status: InstanceStatus,
    /// The input the instance was started with.
    pub input: Value,
    /// The mutable variable scope.
    pub variables: HashMap<String, Value>,
    /// The final output, once terminal.
    #[serde(default)]
    pub output: Option<Value>,
    /// The error that ended the instance, if it failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Per-step state, keyed by step id.
    pub step_instances: HashMap<String, StepInstance>,
    /// The trigger that started this instance, if any.
    #[serde(default)]
    pub trigger_id: Option<String>,
    /// The parent instance, when this is a sub-workflow run.
    #[serde(default)]
    pub parent_instance_id: Option<String>,
    /// The parent step, when this is a sub-workflow run.
    #[serde(default)]
    pub parent_step_id: Option<String>,
    /// Correlates this instance with external flows and wait-for-event matching.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// How often the instance was re-submitted.
    #[serde(default)]
    pub retry_count: u32,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the scheduler picked it up.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}
impl WorkflowInstance {
    /// Creates a fresh pending instance of the given workflow.
    ///
    /// # Arguments
    /// - `workflow_id`: The workflow to run.
    /// - `workflow_version`: The version being run.
    /// - `input`: The instance input.
    ///
    /// # Returns
    /// A new WorkflowInstance with `Status::Pending` and no step state yet.
    pub fn new(workflow_id: impl Into<String>, workflow_version: impl Into<String>, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            status: InstanceStatus::Pending,
            input,
            variables: HashMap::new(),
            output: None,
            error: None,
            step_instances: HashMap::new(),
            trigger_id: None,
            parent_instance_id: None,
            parent_step_id: None,
            correlation_id: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns whether the instance is terminal.
    #[inline]
    pub fn is_terminal(&self) -> bool { self.status.is_terminal() }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_satisfaction() {
        use StepStatus::*;
        for status in [Completed, Skipped, Compensated] {
            assert!(status.satisfies_dependents());
        }
        for status in [Pending, WaitingForDependencies, Running, Failed, Cancelled, TimedOut, WaitingForEvent, WaitingForApproval, Compensating] {
            assert!(!status.satisfies_dependents());
        }
    }

    #[test]
    fn test_instance_serde_roundtrip() {
        let mut instance: WorkflowInstance = WorkflowInstance::new("wf", "1.0.0", serde_json::json!({"who": "world"}));
        instance.status = InstanceStatus::Paused;
        instance.correlation_id = Some("corr-1".into());
        instance.variables.insert("greeting".into(), serde_json::json!("hello"));
        let mut step: StepInstance = StepInstance::new("s1");
        step.status = StepStatus::WaitingForEvent;
        step.job_id = Some("j1".into());
        step.branches.push(BranchInstance { index: 0, steps: HashMap::new(), output: Some(serde_json::json!(1)) });
        instance.step_instances.insert("s1".into(), step);

        let raw: String = serde_json::to_string(&instance).unwrap();
        let back: WorkflowInstance = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, instance.id);
        assert_eq!(back.status, InstanceStatus::Paused);
        assert_eq!(back.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(back.variables.get("greeting"), Some(&serde_json::json!("hello")));
        let step: &StepInstance = &back.step_instances["s1"];
        assert_eq!(step.status, StepStatus::WaitingForEvent);
        assert_eq!(step.job_id.as_deref(), Some("j1"));
        assert_eq!(step.branches.len(), 1);
    }
}
