//  WORKFLOW.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines workflow definitions: named, versioned DAGs of typed steps
//!   with shared variables, triggers and an error strategy. The
//!   type-specific step payload is a tagged variant, so serialization
//!   carries a single discriminator instead of an inheritance tree.
//

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use enum_debug::EnumDebug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::errors::DefinitionError as Error;


/***** AUXILLARY *****/
/// What the engine does when a step fails terminally.
#[derive(Clone, Copy, Debug, Default, EnumDebug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Fail the instance on the first failed step, cancelling its siblings.
    #[default]
    StopOnFirst,
    /// Record the failure and keep running whatever else can run.
    ContinueOnError,
    /// Run the compensation of every already-completed step (in reverse completion order),
    /// then fail the instance.
    Compensate,
}

/// The channels the Notify step can send over. Delivery itself happens behind the
/// out-of-core [`NotificationSender`](crate::executors::NotificationSender) seam.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyChannel {
    /// Electronic mail.
    Email,
    /// An HTTP webhook.
    Webhook,
    /// The host's own log.
    Log,
}

/// The type-specific payload of a workflow step. The serde tag doubles as the wire
/// discriminator.
#[derive(Clone, Debug, EnumDebug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Dispatch a job to a node and wait for its terminal result.
    Job {
        /// The command to execute (supports `${var}` interpolation).
        command: String,
        /// The job parameters; strings support `${var}` interpolation.
        #[serde(default)]
        parameters: Value,
        /// Scheduling priority.
        #[serde(default)]
        priority: i32,
        /// Capabilities the executing node must cover.
        #[serde(default)]
        required_capabilities: HashSet<String>,
        /// Tags the executing node must carry.
        #[serde(default)]
        required_tags: HashSet<String>,
        /// Pin the job to a specific node.
        #[serde(default)]
        target_agent_id: Option<String>,
        /// Per-job timeout.
        #[serde(default)]
        timeout: Option<Duration>,
    },
    /// Run child steps concurrently.
    Parallel {
        /// The child steps; each is the root of its own branch.
        steps: Vec<WorkflowStep>,
        /// Cap on concurrently running children (0 = unbounded).
        #[serde(default)]
        max_concurrency: usize,
        /// Whether the first failed child cancels the rest.
        #[serde(default)]
        fail_fast: bool,
    },
    /// Evaluate a collection expression and run the child steps once per item.
    ForEach {
        /// Expression yielding the collection (must evaluate to a JSON array).
        collection: String,
        /// The variable the current item is bound to in the child scope.
        item_variable: String,
        /// The variable the current index is bound to, if any.
        #[serde(default)]
        index_variable: Option<String>,
        /// The child steps run per item.
        steps: Vec<WorkflowStep>,
    },
    /// Evaluate an expression and run one of two inline branches.
    Conditional {
        /// The branch condition.
        expression: String,
        /// Steps run when the condition holds.
        then_steps: Vec<WorkflowStep>,
        /// Steps run when it does not.
        #[serde(default)]
        else_steps: Vec<WorkflowStep>,
    },
    /// Suspend for a fixed duration.
    Delay {
        /// How long to sleep.
        duration: Duration,
    },
    /// Park the instance until a matching event arrives.
    WaitForEvent {
        /// The event type to wait for.
        event_type: String,
        /// An expression evaluated against the event payload that must match the instance's
        /// correlation id, if set.
        #[serde(default)]
        correlation_key: Option<String>,
        /// How long to wait before the step is skipped.
        #[serde(default)]
        timeout: Option<Duration>,
    },
    /// Park the instance until enough approvers decided.
    Approval {
        /// Who is asked to approve.
        approvers: Vec<String>,
        /// How many approvals are needed (N-of-M).
        #[serde(default = "default_required_approvals")]
        required_approvals: u32,
        /// The message shown to approvers.
        #[serde(default)]
        message: String,
        /// How long to wait before the step is skipped.
        #[serde(default)]
        timeout: Option<Duration>,
    },
    /// Evaluate an expression over the variables and store the result.
    Transform {
        /// The expression to evaluate.
        expression: String,
    },
    /// Send a message over a channel (best effort, out-of-core delivery).
    Notify {
        /// The channel to send over.
        channel: NotifyChannel,
        /// The channel-specific target (address, URL, ...).
        #[serde(default)]
        target: String,
        /// The message (supports `${var}` interpolation).
        message: String,
    },
    /// Launch another workflow as a child instance.
    SubWorkflow {
        /// The id of the workflow to launch.
        workflow_id: String,
        /// The specific version to launch; latest when omitted.
        #[serde(default)]
        version: Option<String>,
        /// Maps child input fields to expressions over the parent's variables.
        #[serde(default)]
        input_mapping: HashMap<String, String>,
        /// Whether to wait for the child to finish (and inherit its outcome).
        #[serde(default = "default_true")]
        wait_for_completion: bool,
    },
}
impl StepConfig {
    /// Returns whether this config parks the instance (wait/approval), which is only
    /// supported at the top nesting level.
    #[inline]
    pub fn is_waiting_kind(&self) -> bool { matches!(self, Self::WaitForEvent { .. } | Self::Approval { .. }) }

    /// Returns the child step lists of this config, if it has any.
    pub fn child_steps(&self) -> Vec<&[WorkflowStep]> {
        match self {
            Self::Parallel { steps, .. } => vec![steps.as_slice()],
            Self::ForEach { steps, .. } => vec![steps.as_slice()],
            Self::Conditional { then_steps, else_steps, .. } => vec![then_steps.as_slice(), else_steps.as_slice()],
            _ => Vec::new(),
        }
    }
}

/// Provides the serde default for `required_approvals`.
#[inline]
fn default_required_approvals() -> u32 { 1 }
/// Provides the serde default `true`.
#[inline]
fn default_true() -> bool { true }





/***** LIBRARY *****/
/// One step of a workflow.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkflowStep {
    /// Unique (within the workflow) id of this step.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// The type-specific payload.
    pub config: StepConfig,
    /// Ids of the steps that must be terminal before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// An optional condition; when it evaluates false the step is skipped.
    #[serde(default)]
    pub condition: Option<String>,
    /// A per-step execution timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// How often the step may be retried after failure.
    #[serde(default)]
    pub max_retries: u32,
    /// How long to wait between retries.
    #[serde(default)]
    pub retry_delay: Option<Duration>,
    /// Whether this step's failure is tolerated regardless of the workflow's error strategy.
    #[serde(default)]
    pub continue_on_error: bool,
    /// The variable the step's output is written to.
    #[serde(default)]
    pub output_variable: Option<String>,
    /// The undo action run when the workflow compensates.
    #[serde(default)]
    pub compensation: Option<Box<WorkflowStep>>,
}
impl WorkflowStep {
    /// Creates a step with the given id and config and defaults for everything else.
    pub fn new(id: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            config,
            depends_on: Vec::new(),
            condition: None,
            timeout: None,
            max_retries: 0,
            retry_delay: None,
            continue_on_error: false,
            output_variable: None,
            compensation: None,
        }
    }
}



/// A trigger declaration inside a workflow definition; the trigger service indexes these when
/// the workflow is activated.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TriggerDefinition {
    /// Unique id of the trigger.
    pub id: String,
    /// The kind-specific payload.
    pub kind: TriggerKind,
    /// Maps workflow input fields to expressions over the event payload.
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    /// Whether this trigger currently fires.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// The kinds of triggers.
#[derive(Clone, Debug, EnumDebug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fires when a matching event is processed.
    Event {
        /// The event type to match.
        event_type: String,
        /// An optional filter expression over the event payload.
        #[serde(default)]
        filter: Option<String>,
    },
    /// Fires when a matching webhook request arrives.
    Webhook {
        /// The webhook path (matched case-insensitively).
        path: String,
        /// The allowed HTTP methods (all when empty).
        #[serde(default)]
        methods: Vec<String>,
        /// A shared secret the caller must present in `X-Webhook-Secret`.
        #[serde(default)]
        secret: Option<String>,
    },
    /// Fires on a schedule. The schedule string is opaque to the core; an external scheduler
    /// translates it into synthetic `schedule:<trigger-id>` events.
    Schedule {
        /// The schedule in the external scheduler's syntax.
        schedule: String,
    },
    /// Fired explicitly through the API.
    Manual {
        /// The schema the manual input must satisfy.
        #[serde(default)]
        input_schema: Vec<InputField>,
    },
}

/// One field of a manual trigger's input schema.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InputField {
    /// The field name.
    pub name: String,
    /// Whether the field must be present.
    #[serde(default)]
    pub required: bool,
    /// When non-empty, the field value must be one of these.
    #[serde(default)]
    pub allowed_values: Vec<Value>,
}



/// A named, versioned workflow definition.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    /// Stable id of the workflow (shared by all its versions).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Semver version string.
    pub version: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// The steps, in declaration order.
    pub steps: Vec<WorkflowStep>,
    /// The triggers that may start this workflow.
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    /// Default values of the workflow variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Timeout for a whole instance.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Instance-level retry budget (consumed by external re-submission).
    #[serde(default)]
    pub max_retries: u32,
    /// What to do when a step fails terminally.
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    /// Whether the workflow may be started and its triggers fire.
    #[serde(default = "default_true")]
    pub is_active: bool,
}
impl WorkflowDefinition {
    /// Validates the definition: semver version, unique step ids, resolvable acyclic
    /// dependencies at every nesting level, and no wait/approval steps inside branches.
    ///
    /// # Errors
    /// This function errors with the first violation found.
    pub fn validate(&self) -> Result<(), Error> {
        // The version must be semver
        if let Err(err) = semver::Version::parse(&self.version) {
            return Err(Error::IllegalVersion { workflow: self.id.clone(), raw: self.version.clone(), err });
        }
        if self.steps.is_empty() {
            return Err(Error::NoSteps { workflow: self.id.clone() });
        }

        self.validate_level(&self.steps, true)?;
        Ok(())
    }

    /// Validates one nesting level of steps, recursing into branches.
    fn validate_level(&self, steps: &[WorkflowStep], top_level: bool) -> Result<(), Error> {
        // Unique ids at this level
        let mut ids: HashSet<&str> = HashSet::with_capacity(steps.len());
        for step in steps {
            if !ids.insert(step.id.as_str()) {
                return Err(Error::DuplicateStepId { workflow: self.id.clone(), step_id: step.id.clone() });
            }
        }

        // Dependencies resolve within this level
        for step in steps {
            for dependency in &step.depends_on {
                if !ids.contains(dependency.as_str()) {
                    return Err(Error::UnknownDependency { workflow: self.id.clone(), step_id: step.id.clone(), dependency: dependency.clone() });
                }
            }
        }

        // The dependency graph is a DAG (Kahn's algorithm)
        let mut indegree: HashMap<&str, usize> = steps.iter().map(|step| (step.id.as_str(), step.depends_on.len())).collect();
        let mut frontier: Vec<&str> = indegree.iter().filter(|(_, degree)| **degree == 0).map(|(id, _)| *id).collect();
        let mut visited: usize = 0;
        while let Some(current) = frontier.pop() {
            visited += 1;
            for step in steps {
                if step.depends_on.iter().any(|dependency| dependency == current) {
                    let degree: &mut usize = indegree.get_mut(step.id.as_str()).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        frontier.push(step.id.as_str());
                    }
                }
            }
        }
        if visited != steps.len() {
            let stuck: &WorkflowStep = steps.iter().find(|step| indegree[step.id.as_str()] > 0).unwrap();
            return Err(Error::DependencyCycle { workflow: self.id.clone(), step_id: stuck.id.clone() });
        }

        // Waits cannot be parked inside branches; recurse into children
        for step in steps {
            if !top_level && step.config.is_waiting_kind() {
                return Err(Error::NestedWait { workflow: self.id.clone(), step_id: step.id.clone() });
            }
            for children in step.config.child_steps() {
                self.validate_level(children, false)?;
            }
            if let Some(compensation) = &step.compensation {
                self.validate_level(std::slice::from_ref(compensation), false)?;
            }
        }
        Ok(())
    }

    /// Finds a step by id at the top level.
    #[inline]
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> { self.steps.iter().find(|step| step.id == step_id) }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use enum_debug::EnumDebug as _;

    use super::*;

    /// Builds a no-op transform step.
    fn step(id: &str, depends_on: &[&str]) -> WorkflowStep {
        let mut step: WorkflowStep = WorkflowStep::new(id, StepConfig::Transform { expression: "true".into() });
        step.depends_on = depends_on.iter().map(|dep| (*dep).to_string()).collect();
        step
    }

    /// Builds a minimal valid definition around the given steps.
    fn definition(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            name: "Test".into(),
            version: "1.0.0".into(),
            description: String::new(),
            steps,
            triggers: Vec::new(),
            variables: HashMap::new(),
            timeout: None,
            max_retries: 0,
            error_strategy: ErrorStrategy::StopOnFirst,
            is_active: true,
        }
    }

    #[test]
    fn test_valid_dag_passes() {
        let def: WorkflowDefinition = definition(vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])]);
        def.validate().unwrap();
    }

    #[test]
    fn test_cycle_is_rejected() {
        let def: WorkflowDefinition = definition(vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(matches!(def.validate(), Err(Error::DependencyCycle { .. })));
    }

    #[test]
    fn test_duplicate_and_unknown_ids_are_rejected() {
        let def: WorkflowDefinition = definition(vec![step("a", &[]), step("a", &[])]);
        assert!(matches!(def.validate(), Err(Error::DuplicateStepId { .. })));

        let def: WorkflowDefinition = definition(vec![step("a", &["ghost"])]);
        assert!(matches!(def.validate(), Err(Error::UnknownDependency { .. })));
    }

    #[test]
    fn test_bad_version_is_rejected() {
        let mut def: WorkflowDefinition = definition(vec![step("a", &[])]);
        def.version = "one-point-oh".into();
        assert!(matches!(def.validate(), Err(Error::IllegalVersion { .. })));
    }

    #[test]
    fn test_nested_wait_is_rejected() {
        let wait: WorkflowStep = WorkflowStep::new("wait", StepConfig::WaitForEvent { event_type: "go".into(), correlation_key: None, timeout: None });
        let parallel: WorkflowStep = WorkflowStep::new("par", StepConfig::Parallel { steps: vec![wait], max_concurrency: 0, fail_fast: false });
        let def: WorkflowDefinition = definition(vec![parallel]);
        assert!(matches!(def.validate(), Err(Error::NestedWait { .. })));
    }

    #[test]
    fn test_step_config_serde_tag_roundtrip() {
        let step: WorkflowStep = WorkflowStep::new("j", StepConfig::Job {
            command: "echo".into(),
            parameters: serde_json::json!({"text": "${greeting}"}),
            priority: 3,
            required_capabilities: HashSet::from(["shell".to_string()]),
            required_tags: HashSet::new(),
            target_agent_id: None,
            timeout: None,
        });
        let raw: String = serde_json::to_string(&step).unwrap();
        assert!(raw.contains("\"type\":\"job\""));
        let back: WorkflowStep = serde_json::from_str(&raw).unwrap();
        match back.config {
            StepConfig::Job { command, priority, .. } => {
                assert_eq!(command, "echo");
                assert_eq!(priority, 3);
            },
            other => panic!("Expected StepConfig::Job, got {:?}", other.variant()),
        }
    }
}
