//  ERRORS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the errors that may occur in the `orbitmesh-exe` crate.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};


/***** LIBRARY *****/
/// Defines errors that relate to parsing or evaluating expressions.
#[derive(Debug)]
pub enum ExprError {
    /// The expression was empty.
    Empty,
    /// A literal failed to parse.
    IllegalLiteral { raw: String },
    /// A quoted string literal was not terminated.
    UnterminatedString { raw: String },
    /// The referenced variable path does not resolve.
    UnknownPath { path: String },
    /// The two operands cannot be ordered against each other.
    Unorderable { lhs: String, rhs: String },
}
impl Display for ExprError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use ExprError::*;
        match self {
            Empty => write!(f, "Cannot evaluate an empty expression"),
            IllegalLiteral { raw } => write!(f, "Illegal literal '{raw}'"),
            UnterminatedString { raw } => write!(f, "Unterminated string literal in '{raw}'"),
            UnknownPath { path } => write!(f, "Variable path '{path}' does not resolve"),
            Unorderable { lhs, rhs } => write!(f, "Cannot order '{lhs}' against '{rhs}'"),
        }
    }
}
impl Error for ExprError {}



/// Defines errors that relate to workflow definitions.
#[derive(Debug)]
pub enum DefinitionError {
    /// The version string is not semver.
    IllegalVersion { workflow: String, raw: String, err: semver::Error },
    /// Two steps share an id.
    DuplicateStepId { workflow: String, step_id: String },
    /// A step depends on a step that does not exist at its nesting level.
    UnknownDependency { workflow: String, step_id: String, dependency: String },
    /// The dependencies contain a cycle.
    DependencyCycle { workflow: String, step_id: String },
    /// A wait/approval step was nested inside a branch, where the engine cannot park it.
    NestedWait { workflow: String, step_id: String },
    /// The workflow has no steps at all.
    NoSteps { workflow: String },
}
impl Display for DefinitionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use DefinitionError::*;
        match self {
            IllegalVersion { workflow, raw, .. } => write!(f, "Workflow '{workflow}' has illegal version '{raw}'"),
            DuplicateStepId { workflow, step_id } => write!(f, "Workflow '{workflow}' has duplicate step id '{step_id}'"),
            UnknownDependency { workflow, step_id, dependency } => {
                write!(f, "Step '{step_id}' in workflow '{workflow}' depends on unknown step '{dependency}'")
            },
            DependencyCycle { workflow, step_id } => write!(f, "Workflow '{workflow}' has a dependency cycle through step '{step_id}'"),
            NestedWait { workflow, step_id } => {
                write!(f, "Step '{step_id}' in workflow '{workflow}' is a wait/approval step nested in a branch, which is not supported")
            },
            NoSteps { workflow } => write!(f, "Workflow '{workflow}' has no steps"),
        }
    }
}
impl Error for DefinitionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use DefinitionError::*;
        match self {
            IllegalVersion { err, .. } => Some(err),
            _ => None,
        }
    }
}



/// Defines errors that relate to the workflow repositories.
#[derive(Debug)]
pub enum WorkflowRepoError {
    /// The referenced workflow (or version) does not exist.
    UnknownWorkflow { id: String, version: Option<String> },
    /// The workflow version already exists.
    VersionConflict { id: String, version: String },
    /// The referenced instance does not exist.
    UnknownInstance { id: String },
    /// The backing store failed.
    Storage { what: String },
}
impl Display for WorkflowRepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use WorkflowRepoError::*;
        match self {
            UnknownWorkflow { id, version: Some(version) } => write!(f, "Unknown workflow '{id}' version '{version}'"),
            UnknownWorkflow { id, version: None } => write!(f, "Unknown workflow '{id}'"),
            VersionConflict { id, version } => write!(f, "Workflow '{id}' already has a version '{version}'"),
            UnknownInstance { id } => write!(f, "Unknown workflow instance '{id}'"),
            Storage { what } => write!(f, "Workflow store failure: {what}"),
        }
    }
}
impl Error for WorkflowRepoError {}



/// Defines errors that relate to the workflow engine.
#[derive(Debug)]
pub enum EngineError {
    /// The definition failed validation.
    Definition { err: DefinitionError },
    /// The repository failed.
    Repository { err: WorkflowRepoError },
    /// The referenced instance is not live (not running/paused in this engine).
    InstanceNotLive { id: String },
    /// The workflow is inactive and may not be started.
    WorkflowInactive { id: String },
}
impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use EngineError::*;
        match self {
            Definition { .. } => write!(f, "Workflow definition is invalid"),
            Repository { .. } => write!(f, "Workflow repository failure"),
            InstanceNotLive { id } => write!(f, "Workflow instance '{id}' is not live"),
            WorkflowInactive { id } => write!(f, "Workflow '{id}' is inactive"),
        }
    }
}
impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use EngineError::*;
        match self {
            Definition { err } => Some(err),
            Repository { err } => Some(err),
            _ => None,
        }
    }
}
impl From<DefinitionError> for EngineError {
    #[inline]
    fn from(err: DefinitionError) -> Self { Self::Definition { err } }
}
impl From<WorkflowRepoError> for EngineError {
    #[inline]
    fn from(err: WorkflowRepoError) -> Self { Self::Repository { err } }
}



/// Defines errors that relate to the trigger service.
#[derive(Debug)]
pub enum TriggerError {
    /// The webhook secret did not match.
    BadWebhookSecret { path: String },
    /// The HTTP method is not in the trigger's allowed set.
    MethodNotAllowed { path: String, method: String },
    /// Manual input failed schema validation.
    InputValidation { workflow: String, reason: String },
    /// The referenced workflow has no manual trigger.
    NoManualTrigger { workflow: String },
    /// Starting the workflow failed.
    Engine { err: EngineError },
    /// The repository failed.
    Repository { err: WorkflowRepoError },
}
impl Display for TriggerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use TriggerError::*;
        match self {
            BadWebhookSecret { path } => write!(f, "Webhook secret mismatch for path '{path}'"),
            MethodNotAllowed { path, method } => write!(f, "Method '{method}' is not allowed for webhook path '{path}'"),
            InputValidation { workflow, reason } => write!(f, "Input for workflow '{workflow}' is invalid: {reason}"),
            NoManualTrigger { workflow } => write!(f, "Workflow '{workflow}' has no manual trigger"),
            Engine { .. } => write!(f, "Failed to start workflow"),
            Repository { .. } => write!(f, "Workflow repository failure"),
        }
    }
}
impl Error for TriggerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use TriggerError::*;
        match self {
            Engine { err } => Some(err),
            Repository { err } => Some(err),
            _ => None,
        }
    }
}
impl From<EngineError> for TriggerError {
    #[inline]
    fn from(err: EngineError) -> Self { Self::Engine { err } }
}
impl From<WorkflowRepoError> for TriggerError {
    #[inline]
    fn from(err: WorkflowRepoError) -> Self { Self::Repository { err } }
}
