//  EXECUTORS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the step executors. Every executor turns one
//!   [`WorkflowStep`] into a [`StepReport`]: either a terminal outcome or
//!   a waiting marker that parks the instance. Branching executors
//!   (parallel, foreach, conditional) run their child DAGs here,
//!   recursively; only wait/approval steps are left to the scheduler,
//!   since they must park the whole instance.
//

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_recursion::async_recursion;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use specifications::jobs::{Job, JobRequest, JobStatus};
use tokio_util::sync::CancellationToken;

use crate::engine::WorkflowEngine;
use crate::expression;
use crate::instance::{BranchInstance, StepInstance, StepStatus};
use crate::workflow::{NotifyChannel, StepConfig, WorkflowStep};


/***** CONSTANTS *****/
/// How often executors poll for job / child-instance completion.
const POLL_INTERVAL: Duration = Duration::from_millis(100);





/***** AUXILLARY *****/
/// What an executor hands back to the scheduler.
#[derive(Clone, Debug)]
pub enum StepOutcome {
    /// The step succeeded with the given output.
    Completed { output: Value },
    /// The step failed.
    Failed { error: String },
    /// The step exceeded its own timeout.
    TimedOut { error: String },
    /// The step was cancelled.
    Cancelled,
    /// Park the instance until a matching event arrives.
    WaitingForEvent { event_type: String, correlation_key: Option<String>, timeout: Option<Duration> },
    /// Park the instance until enough approvals arrive.
    WaitingForApproval { required_approvals: u32, timeout: Option<Duration> },
}

/// An executor's full report: the outcome plus whatever bookkeeping it produced on the way.
#[derive(Clone, Debug)]
pub struct StepReport {
    /// The outcome itself.
    pub outcome: StepOutcome,
    /// Branch state, for parallel/foreach steps.
    pub branches: Vec<BranchInstance>,
    /// The job dispatched by a job step, if any.
    pub job_id: Option<String>,
    /// The child instance launched by a sub-workflow step, if any.
    pub sub_workflow_instance_id: Option<String>,
}
impl StepReport {
    /// Wraps a bare outcome without bookkeeping.
    #[inline]
    fn bare(outcome: StepOutcome) -> Self { Self { outcome, branches: Vec::new(), job_id: None, sub_workflow_instance_id: None } }

    /// Shorthand for a completed report.
    #[inline]
    fn completed(output: Value) -> Self { Self::bare(StepOutcome::Completed { output }) }

    /// Shorthand for a failed report.
    #[inline]
    fn failed(error: impl Into<String>) -> Self { Self::bare(StepOutcome::Failed { error: error.into() }) }
}

/// The out-of-core seam for the Notify and Approval steps. The host wires a real sender;
/// tests and minimal deployments use [`LogNotifier`].
#[async_trait]
pub trait NotificationSender: 'static + Send + Sync + std::fmt::Debug {
    /// Sends a message over the given channel.
    ///
    /// # Errors
    /// This function errors (with a human-readable reason) if delivery failed.
    async fn send(&self, channel: NotifyChannel, target: &str, message: &str) -> Result<(), String>;
}

/// A [`NotificationSender`] that just logs. Email/webhook delivery lives outside the core.
#[derive(Debug)]
pub struct LogNotifier;
#[async_trait]
impl NotificationSender for LogNotifier {
    async fn send(&self, channel: NotifyChannel, target: &str, message: &str) -> Result<(), String> {
        log::info!("[notify/{channel:?}] to '{target}': {message}");
        Ok(())
    }
}

/// Everything an executor needs to do its work.
#[derive(Clone)]
pub struct ExecutorContext {
    /// The engine, for job dispatch and sub-workflows.
    pub engine: Arc<WorkflowEngine>,
    /// The instance this step belongs to.
    pub instance_id: String,
    /// The step being executed.
    pub step_id: String,
    /// The instance's correlation id, if any.
    pub correlation_id: Option<String>,
    /// A snapshot of the variable scope at launch time.
    pub variables: HashMap<String, Value>,
    /// Cancelled when the step (or the whole instance) must stop.
    pub cancel: CancellationToken,
    /// The engine-level retry attempt, used to salt job idempotency keys.
    pub attempt: u32,
}





/***** HELPER FUNCTIONS *****/
/// Interprets a job's result payload as the step output: JSON when it parses, a string
/// otherwise, null when empty.
fn data_to_output(data: &[u8]) -> Value {
    if data.is_empty() {
        return Value::Null;
    }
    match serde_json::from_slice::<Value>(data) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(data).into_owned()),
    }
}

/// The result of running one level of child steps.
struct LevelRun {
    /// Per-step state, keyed by step id.
    states: HashMap<String, StepInstance>,
    /// The output of the last child that completed.
    last_output: Option<Value>,
    /// The scope as the children left it.
    variables: HashMap<String, Value>,
    /// The error that stopped the level, if any (None means every child wrapped up).
    error: Option<String>,
    /// Whether the level was cancelled rather than failed.
    cancelled: bool,
}

/// Runs one level of child steps sequentially, in dependency order, inside a branch scope.
///
/// Wait/approval steps cannot occur here (definition validation rejects them inside
/// branches).
#[async_recursion]
async fn run_level(ctx: &ExecutorContext, steps: &[WorkflowStep], mut variables: HashMap<String, Value>) -> LevelRun {
    let mut states: HashMap<String, StepInstance> = steps.iter().map(|step| (step.id.clone(), StepInstance::new(&step.id))).collect();
    let mut last_output: Option<Value> = None;

    loop {
        // Find the next runnable child
        let next: Option<&WorkflowStep> = steps.iter().find(|step| {
            states[&step.id].status == StepStatus::Pending
                && step.depends_on.iter().all(|dependency| states.get(dependency).map(|si| si.status.satisfies_dependents()).unwrap_or(false))
        });
        let step: &WorkflowStep = match next {
            Some(step) => step,
            None => break,
        };

        // Condition check
        if let Some(condition) = &step.condition {
            match expression::evaluate_bool(condition, &variables) {
                Ok(true) => {},
                Ok(false) => {
                    let si: &mut StepInstance = states.get_mut(&step.id).unwrap();
                    si.status = StepStatus::Skipped;
                    si.completed_at = Some(Utc::now());
                    continue;
                },
                Err(err) => {
                    let si: &mut StepInstance = states.get_mut(&step.id).unwrap();
                    si.status = StepStatus::Failed;
                    si.error = Some(err.to_string());
                    si.completed_at = Some(Utc::now());
                    if step.continue_on_error {
                        continue;
                    }
                    return LevelRun { states, last_output, variables, error: Some(err.to_string()), cancelled: false };
                },
            }
        }

        // Run it, with its retry budget
        let mut attempt: u32 = 0;
        let report: StepReport = loop {
            {
                let si: &mut StepInstance = states.get_mut(&step.id).unwrap();
                si.status = StepStatus::Running;
                si.started_at.get_or_insert_with(Utc::now);
                si.retry_count = attempt;
            }
            let sub_ctx: ExecutorContext = ExecutorContext { variables: variables.clone(), attempt, step_id: step.id.clone(), ..ctx.clone() };
            let report: StepReport = execute_step(sub_ctx, step.clone()).await;
            let retryable: bool =
                matches!(report.outcome, StepOutcome::Failed { .. } | StepOutcome::TimedOut { .. }) && attempt < step.max_retries;
            if retryable {
                attempt += 1;
                if let Some(delay) = step.retry_delay {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
            break report;
        };

        // Book the result
        let si: &mut StepInstance = states.get_mut(&step.id).unwrap();
        si.branches = report.branches;
        si.job_id = report.job_id;
        si.sub_workflow_instance_id = report.sub_workflow_instance_id;
        si.completed_at = Some(Utc::now());
        match report.outcome {
            StepOutcome::Completed { output } => {
                si.status = StepStatus::Completed;
                si.output = Some(output.clone());
                if let Some(var) = &step.output_variable {
                    variables.insert(var.clone(), output.clone());
                }
                last_output = Some(output);
            },
            StepOutcome::Failed { error } => {
                si.status = StepStatus::Failed;
                si.error = Some(error.clone());
                if !step.continue_on_error {
                    return LevelRun { states, last_output, variables, error: Some(error), cancelled: false };
                }
            },
            StepOutcome::TimedOut { error } => {
                si.status = StepStatus::TimedOut;
                si.error = Some(error.clone());
                if !step.continue_on_error {
                    return LevelRun { states, last_output, variables, error: Some(error), cancelled: false };
                }
            },
            StepOutcome::Cancelled => {
                si.status = StepStatus::Cancelled;
                return LevelRun { states, last_output, variables, error: Some("cancelled".into()), cancelled: true };
            },
            // Validation makes waits unreachable inside branches
            StepOutcome::WaitingForEvent { .. } | StepOutcome::WaitingForApproval { .. } => {
                si.status = StepStatus::Failed;
                si.error = Some("wait step inside a branch".into());
                return LevelRun { states, last_output, variables, error: Some("wait step inside a branch".into()), cancelled: false };
            },
        }
    }

    // Anything still pending had unsatisfiable dependencies; mark it skipped
    for si in states.values_mut() {
        if si.status == StepStatus::Pending {
            si.status = StepStatus::Skipped;
        }
    }
    LevelRun { states, last_output, variables, error: None, cancelled: false }
}





/***** EXECUTORS *****/
/// Executes a single step, honouring the step's own timeout.
///
/// # Arguments
/// - `ctx`: The execution context (engine handle, variable snapshot, cancellation).
/// - `step`: The step to execute.
///
/// # Returns
/// The step's [`StepReport`]. Never errors; failures are reported in the outcome.
pub async fn execute_step(ctx: ExecutorContext, step: WorkflowStep) -> StepReport {
    debug!("Executing step '{}' of instance '{}'", step.id, ctx.instance_id);
    match step.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, execute_config(&ctx, &step)).await {
            Ok(report) => report,
            Err(_) => StepReport::bare(StepOutcome::TimedOut { error: format!("step '{}' exceeded its timeout", step.id) }),
        },
        None => execute_config(&ctx, &step).await,
    }
}

/// Dispatches on the step's config variant.
#[async_recursion]
async fn execute_config(ctx: &ExecutorContext, step: &WorkflowStep) -> StepReport {
    match &step.config {
        StepConfig::Job { command, parameters, priority, required_capabilities, required_tags, target_agent_id, timeout } => {
            execute_job(ctx, step, command, parameters, *priority, required_capabilities, required_tags, target_agent_id.as_deref(), *timeout).await
        },

        StepConfig::Parallel { steps, max_concurrency, fail_fast } => execute_parallel(ctx, steps, *max_concurrency, *fail_fast).await,

        StepConfig::ForEach { collection, item_variable, index_variable, steps } => {
            execute_foreach(ctx, collection, item_variable, index_variable.as_deref(), steps).await
        },

        StepConfig::Conditional { expression: condition, then_steps, else_steps } => {
            let branch: &[WorkflowStep] = match expression::evaluate_bool(condition, &ctx.variables) {
                Ok(true) => then_steps,
                Ok(false) => else_steps,
                Err(err) => return StepReport::failed(format!("condition failed to evaluate: {err}")),
            };
            if branch.is_empty() {
                return StepReport::completed(Value::Null);
            }
            let run: LevelRun = run_level(ctx, branch, ctx.variables.clone()).await;
            let mut report: StepReport = match run.error {
                None => StepReport::completed(run.last_output.clone().unwrap_or(Value::Null)),
                Some(_) if run.cancelled => StepReport::bare(StepOutcome::Cancelled),
                Some(error) => StepReport::failed(error),
            };
            report.branches = vec![BranchInstance { index: 0, steps: run.states, output: run.last_output }];
            report
        },

        StepConfig::Delay { duration } => {
            tokio::select! {
                _ = tokio::time::sleep(*duration) => StepReport::completed(Value::Null),
                _ = ctx.cancel.cancelled() => StepReport::bare(StepOutcome::Cancelled),
            }
        },

        StepConfig::WaitForEvent { event_type, correlation_key, timeout } => StepReport::bare(StepOutcome::WaitingForEvent {
            event_type: event_type.clone(),
            correlation_key: correlation_key.clone(),
            timeout: *timeout,
        }),

        StepConfig::Approval { approvers, required_approvals, message, timeout } => {
            // Ask the approvers (best effort), then park
            let message: String = expression::interpolate(message, &ctx.variables);
            for approver in approvers {
                if let Err(err) = ctx.engine.notifier().send(NotifyChannel::Log, approver, &message).await {
                    warn!("Failed to notify approver '{approver}': {err}");
                }
            }
            StepReport::bare(StepOutcome::WaitingForApproval { required_approvals: (*required_approvals).max(1), timeout: *timeout })
        },

        StepConfig::Transform { expression: expr } => match expression::evaluate(expr, &ctx.variables) {
            Ok(value) => StepReport::completed(value),
            Err(err) => StepReport::failed(format!("transform failed: {err}")),
        },

        StepConfig::Notify { channel, target, message } => {
            let target: String = expression::interpolate(target, &ctx.variables);
            let message: String = expression::interpolate(message, &ctx.variables);
            match ctx.engine.notifier().send(*channel, &target, &message).await {
                Ok(_) => StepReport::completed(Value::Null),
                Err(err) => StepReport::failed(format!("notification failed: {err}")),
            }
        },

        StepConfig::SubWorkflow { workflow_id, version, input_mapping, wait_for_completion } => {
            execute_sub_workflow(ctx, workflow_id, version.as_deref(), input_mapping, *wait_for_completion).await
        },
    }
}

/// Executes a job step: enqueue with the job manager, then poll until terminal.
#[allow(clippy::too_many_arguments)]
async fn execute_job(
    ctx: &ExecutorContext,
    step: &WorkflowStep,
    command: &str,
    parameters: &Value,
    priority: i32,
    required_capabilities: &std::collections::HashSet<String>,
    required_tags: &std::collections::HashSet<String>,
    target_agent_id: Option<&str>,
    timeout: Option<Duration>,
) -> StepReport {
    // Resolve the config against the variable scope
    let command: String = expression::interpolate(command, &ctx.variables);
    let parameters: Value = expression::resolve_value(parameters, &ctx.variables);

    let mut request: JobRequest = JobRequest::new(command);
    // Engine-side retries salt the key, so each attempt is its own job while reconnect
    // replays still collapse
    request.idempotency_key = Some(format!("wf:{}:{}:{}", ctx.instance_id, step.id, ctx.attempt));
    request.parameters = serde_json::to_vec(&parameters).unwrap_or_default();
    request.priority = priority;
    request.required_capabilities = required_capabilities.clone();
    request.required_tags = required_tags.clone();
    request.target_agent_id = target_agent_id.map(String::from);
    request.timeout = timeout;
    request.correlation_id = Some(ctx.instance_id.clone());

    let job: Job = match ctx.engine.jobs().enqueue(request).await {
        Ok(job) => job,
        Err(err) => return StepReport::failed(format!("failed to enqueue job: {err}")),
    };
    let job_id: String = job.id().to_string();

    // Poll until terminal, bailing out on cancellation
    let outcome: StepOutcome = loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {},
            _ = ctx.cancel.cancelled() => {
                if let Err(err) = ctx.engine.jobs().cancel(&job_id, Some("workflow cancelled".into())).await {
                    warn!("Failed to cancel job '{job_id}' of cancelled step '{}': {err}", step.id);
                }
                break StepOutcome::Cancelled;
            },
        }

        let job: Job = match ctx.engine.jobs().get(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => break StepOutcome::Failed { error: format!("job '{job_id}' vanished") },
            Err(err) => break StepOutcome::Failed { error: format!("failed to poll job '{job_id}': {err}") },
        };
        if !job.is_terminal() {
            continue;
        }

        break match job.status {
            JobStatus::Completed => {
                let data: Vec<u8> = job.result.map(|result| result.data).unwrap_or_default();
                StepOutcome::Completed { output: data_to_output(&data) }
            },
            JobStatus::Failed => {
                let error: String = job.result.and_then(|result| result.error).unwrap_or_else(|| "job failed".into());
                StepOutcome::Failed { error }
            },
            JobStatus::Cancelled => StepOutcome::Cancelled,
            JobStatus::TimedOut => StepOutcome::TimedOut { error: format!("job '{job_id}' timed out") },
            // Guarded by is_terminal() above
            _ => unreachable!(),
        };
    };

    StepReport { outcome, branches: Vec::new(), job_id: Some(job_id), sub_workflow_instance_id: None }
}

/// Executes a parallel step: every child step becomes a branch; runnable branches run
/// concurrently up to `max_concurrency`.
async fn execute_parallel(ctx: &ExecutorContext, steps: &[WorkflowStep], max_concurrency: usize, fail_fast: bool) -> StepReport {
    use futures_util::stream::{FuturesUnordered, StreamExt as _};

    let sibling_cancel: CancellationToken = ctx.cancel.child_token();
    let limit: usize = if max_concurrency == 0 { usize::MAX } else { max_concurrency };

    let mut branches: Vec<BranchInstance> = Vec::with_capacity(steps.len());
    let mut running: FuturesUnordered<_> = FuturesUnordered::new();
    let mut next: usize = 0;
    let mut first_error: Option<String> = None;
    let mut cancelled: bool = false;
    let mut aborted: bool = false;

    loop {
        // Top up the running set (unless fail-fast already pulled the plug)
        while !aborted && next < steps.len() && running.len() < limit {
            let step: WorkflowStep = steps[next].clone();
            let index: usize = next;
            let branch_ctx: ExecutorContext = ExecutorContext { cancel: sibling_cancel.clone(), ..ctx.clone() };
            running.push(async move {
                let run: LevelRun = run_level(&branch_ctx, std::slice::from_ref(&step), branch_ctx.variables.clone()).await;
                (index, run)
            });
            next += 1;
        }
        if running.is_empty() {
            break;
        }

        // Wait for the next branch to finish
        let (index, run): (usize, LevelRun) = match running.next().await {
            Some(done) => done,
            None => break,
        };
        if run.cancelled {
            cancelled = true;
            aborted = true;
        } else if let Some(error) = &run.error {
            if first_error.is_none() {
                first_error = Some(error.clone());
            }
            if fail_fast {
                sibling_cancel.cancel();
                aborted = true;
            }
        }
        branches.push(BranchInstance { index, output: run.last_output.clone(), steps: run.states });
    }
    branches.sort_by_key(|branch| branch.index);

    // Branches that never got to run (fail-fast) are recorded as cancelled
    while next < steps.len() {
        let step: &WorkflowStep = &steps[next];
        let mut si: StepInstance = StepInstance::new(&step.id);
        si.status = StepStatus::Cancelled;
        branches.push(BranchInstance { index: next, steps: HashMap::from([(step.id.clone(), si)]), output: None });
        next += 1;
    }

    let outcome: StepOutcome = if cancelled && first_error.is_none() {
        StepOutcome::Cancelled
    } else if let Some(error) = first_error {
        StepOutcome::Failed { error }
    } else {
        let outputs: Vec<Value> = branches.iter().map(|branch| branch.output.clone().unwrap_or(Value::Null)).collect();
        StepOutcome::Completed { output: Value::Array(outputs) }
    };
    StepReport { outcome, branches, job_id: None, sub_workflow_instance_id: None }
}

/// Executes a foreach step: bind each item (and index) in a child scope and run the child
/// steps; outputs aggregate into a list, in item order.
async fn execute_foreach(
    ctx: &ExecutorContext,
    collection: &str,
    item_variable: &str,
    index_variable: Option<&str>,
    steps: &[WorkflowStep],
) -> StepReport {
    let items: Vec<Value> = match expression::evaluate(collection, &ctx.variables) {
        Ok(Value::Array(items)) => items,
        Ok(other) => return StepReport::failed(format!("foreach collection evaluated to {other} instead of a list")),
        Err(err) => return StepReport::failed(format!("foreach collection failed to evaluate: {err}")),
    };

    let mut branches: Vec<BranchInstance> = Vec::with_capacity(items.len());
    let mut outputs: Vec<Value> = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return StepReport { outcome: StepOutcome::Cancelled, branches, job_id: None, sub_workflow_instance_id: None };
        }

        // Bind the item scope
        let mut scope: HashMap<String, Value> = ctx.variables.clone();
        scope.insert(item_variable.to_string(), item);
        if let Some(index_variable) = index_variable {
            scope.insert(index_variable.to_string(), Value::Number(index.into()));
        }

        let run: LevelRun = run_level(ctx, steps, scope).await;
        let failed: Option<String> = run.error.clone();
        let was_cancelled: bool = run.cancelled;
        branches.push(BranchInstance { index, output: run.last_output.clone(), steps: run.states });
        if was_cancelled {
            return StepReport { outcome: StepOutcome::Cancelled, branches, job_id: None, sub_workflow_instance_id: None };
        }
        if let Some(error) = failed {
            return StepReport {
                outcome: StepOutcome::Failed { error: format!("item {index} failed: {error}") },
                branches,
                job_id: None,
                sub_workflow_instance_id: None,
            };
        }
        outputs.push(run.last_output.unwrap_or(Value::Null));
    }

    StepReport { outcome: StepOutcome::Completed { output: Value::Array(outputs) }, branches, job_id: None, sub_workflow_instance_id: None }
}

/// Executes a sub-workflow step: launch the child instance and (optionally) inherit its
/// outcome.
async fn execute_sub_workflow(
    ctx: &ExecutorContext,
    workflow_id: &str,
    version: Option<&str>,
    input_mapping: &HashMap<String, String>,
    wait_for_completion: bool,
) -> StepReport {
    // Build the child input from the mapping
    let mut input: serde_json::Map<String, Value> = serde_json::Map::with_capacity(input_mapping.len());
    for (field, expr) in input_mapping {
        match expression::evaluate(expr, &ctx.variables) {
            Ok(value) => {
                input.insert(field.clone(), value);
            },
            Err(err) => return StepReport::failed(format!("input mapping for '{field}' failed: {err}")),
        }
    }

    let child_id: String = match ctx
        .engine
        .start_child(workflow_id, version, Value::Object(input), &ctx.instance_id, &ctx.step_id, ctx.correlation_id.clone())
        .await
    {
        Ok(child_id) => child_id,
        Err(err) => return StepReport::failed(format!("failed to start sub-workflow '{workflow_id}': {err}")),
    };

    if !wait_for_completion {
        return StepReport {
            outcome: StepOutcome::Completed { output: serde_json::json!({ "instance_id": child_id }) },
            branches: Vec::new(),
            job_id: None,
            sub_workflow_instance_id: Some(child_id),
        };
    }

    // Wait for the child to reach a terminal state
    let outcome: StepOutcome = loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {},
            _ = ctx.cancel.cancelled() => {
                if let Err(err) = ctx.engine.cancel(&child_id, Some("parent cancelled".into())).await {
                    warn!("Failed to cancel sub-workflow instance '{child_id}': {err}");
                }
                break StepOutcome::Cancelled;
            },
        }

        let child = match ctx.engine.instances().get(&child_id).await {
            Ok(Some(child)) => child,
            Ok(None) => break StepOutcome::Failed { error: format!("sub-workflow instance '{child_id}' vanished") },
            Err(err) => break StepOutcome::Failed { error: format!("failed to poll sub-workflow instance '{child_id}': {err}") },
        };

        use crate::instance::InstanceStatus;
        break match child.status {
            InstanceStatus::Completed => StepOutcome::Completed { output: child.output.unwrap_or(Value::Null) },
            InstanceStatus::Failed => StepOutcome::Failed { error: child.error.unwrap_or_else(|| "sub-workflow failed".into()) },
            InstanceStatus::Cancelled => StepOutcome::Cancelled,
            InstanceStatus::TimedOut => StepOutcome::TimedOut { error: format!("sub-workflow instance '{child_id}' timed out") },
            _ => continue,
        };
    };

    StepReport { outcome, branches: Vec::new(), job_id: None, sub_workflow_instance_id: Some(child_id) }
}
