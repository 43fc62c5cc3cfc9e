//  ENGINE.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the workflow engine: instances run as single-writer
//!   scheduler tasks that fan step executions out to subtasks and react
//!   to their reports, to external events/approvals and to timeouts.
//!   Waits are plain states, not suspended futures; the engine is a
//!   state machine driven by messages, so a parked instance costs
//!   nothing but its record.
//

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use orbitmesh_tsk::manager::JobManager;

pub use crate::errors::EngineError as Error;
use crate::executors::{self, ExecutorContext, NotificationSender, StepOutcome, StepReport};
use crate::expression::{self, INPUT_VARIABLE};
use crate::instance::{InstanceStatus, StepInstance, StepStatus, WorkflowInstance};
use crate::repository::{InstanceRepository, WorkflowRepository};
use crate::workflow::{ErrorStrategy, StepConfig, WorkflowDefinition, WorkflowStep};


/***** CONSTANTS *****/
/// The capacity of the engine's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;





/***** AUXILLARY *****/
/// The events the engine publishes to interested observers (e.g., the dashboard feed).
#[derive(Clone, Debug)]
pub enum WorkflowEvent {
    /// An instance started running.
    InstanceStarted { instance_id: String, workflow_id: String },
    /// An instance completed successfully.
    InstanceCompleted { instance_id: String, workflow_id: String },
    /// An instance ended in failure (including cancellation and timeout).
    InstanceFailed { instance_id: String, workflow_id: String, error: String },
    /// A step's executor started.
    StepStarted { instance_id: String, step_id: String },
    /// A step completed.
    StepCompleted { instance_id: String, step_id: String },
}

/// The messages a runner reacts to.
#[derive(Debug)]
enum RunnerMsg {
    /// An executor finished (or parked).
    StepDone { step_id: String, report: StepReport },
    /// A retry delay elapsed; the step may be rescheduled.
    StepRetry { step_id: String },
    /// A wait/approval step's timeout elapsed.
    WaitTimeout { step_id: String },
    /// A matching event arrived for a waiting step.
    Event { step_id: String, payload: Value },
    /// An approval decision arrived for a waiting step.
    Approval { step_id: String, approved: bool },
    /// The instance is asked to cancel.
    Cancel { reason: Option<String> },
}

/// The engine's handle on a live runner.
#[derive(Debug)]
struct RunnerHandle {
    /// Delivers messages into the runner's loop.
    tx: mpsc::UnboundedSender<RunnerMsg>,
    /// Cancelled to stop the runner's executors.
    cancel: CancellationToken,
}

/// One parked wait-for-event step, indexed by event type.
#[derive(Clone, Debug)]
struct WaitRegistration {
    /// The waiting instance.
    instance_id: String,
    /// The waiting step.
    step_id: String,
    /// The expression evaluated against the event payload for correlation, if any.
    correlation_key: Option<String>,
    /// The instance's correlation id the evaluated key must equal, if the instance has one.
    expected: Option<String>,
}
impl WaitRegistration {
    /// Returns whether the given event payload matches this registration.
    fn matches(&self, payload: &Value) -> bool {
        let correlation_key: &str = match &self.correlation_key {
            Some(correlation_key) => correlation_key,
            None => return true,
        };

        let scope: HashMap<String, Value> = HashMap::from([(INPUT_VARIABLE.to_string(), payload.clone())]);
        let value: Value = match expression::evaluate(correlation_key, &scope) {
            Ok(value) => value,
            Err(_) => return false,
        };
        match &self.expected {
            Some(expected) => match &value {
                Value::String(s) => s == expected,
                other => &other.to_string() == expected,
            },
            // No correlation id on the instance: the key only needs to resolve
            None => true,
        }
    }
}





/***** LIBRARY *****/
/// The workflow engine. Owns the live runners; definitions and instances live behind their
/// repositories.
#[derive(Debug)]
pub struct WorkflowEngine {
    /// The definition store.
    definitions: Arc<dyn WorkflowRepository>,
    /// The instance store.
    instances: Arc<dyn InstanceRepository>,
    /// The job manager job steps dispatch through.
    jobs: Arc<JobManager>,
    /// The out-of-core notification seam.
    notifier: Arc<dyn NotificationSender>,
    /// Live runners, keyed by instance id.
    running: DashMap<String, RunnerHandle>,
    /// Parked wait-for-event steps, keyed by event type.
    waits: DashMap<String, Vec<WaitRegistration>>,
    /// The channel on which workflow events are published.
    events: broadcast::Sender<WorkflowEvent>,
}

impl WorkflowEngine {
    /// Constructor for the WorkflowEngine.
    ///
    /// # Arguments
    /// - `definitions`: The workflow definition store.
    /// - `instances`: The workflow instance store.
    /// - `jobs`: The job manager to dispatch job steps through.
    /// - `notifier`: The notification seam for Notify/Approval steps.
    ///
    /// # Returns
    /// A new WorkflowEngine instance with no live runners.
    pub fn new(
        definitions: Arc<dyn WorkflowRepository>,
        instances: Arc<dyn InstanceRepository>,
        jobs: Arc<JobManager>,
        notifier: Arc<dyn NotificationSender>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { definitions, instances, jobs, notifier, running: DashMap::new(), waits: DashMap::new(), events }
    }

    /// Subscribes to workflow events.
    #[inline]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> { self.events.subscribe() }

    /// Returns the definition store.
    #[inline]
    pub fn definitions(&self) -> &Arc<dyn WorkflowRepository> { &self.definitions }

    /// Returns the instance store.
    #[inline]
    pub fn instances(&self) -> &Arc<dyn InstanceRepository> { &self.instances }

    /// Returns the job manager.
    #[inline]
    pub fn jobs(&self) -> &Arc<JobManager> { &self.jobs }

    /// Returns the notification seam.
    #[inline]
    pub fn notifier(&self) -> &Arc<dyn NotificationSender> { &self.notifier }

    /// Starts a new instance of the given workflow.
    ///
    /// # Arguments
    /// - `workflow_id`: The workflow to run.
    /// - `version`: The version to run; latest when None.
    /// - `input`: The instance input.
    /// - `trigger_id`: The trigger that caused this start, if any.
    /// - `correlation_id`: Correlates the instance with external flows.
    ///
    /// # Returns
    /// The freshly created instance (already running).
    ///
    /// # Errors
    /// This function errors if the workflow is unknown, inactive or invalid.
    pub async fn start(
        self: &Arc<Self>,
        workflow_id: &str,
        version: Option<&str>,
        input: Value,
        trigger_id: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<WorkflowInstance, Error> {
        self.start_inner(workflow_id, version, input, trigger_id, correlation_id, None, None).await
    }

    /// Starts a child instance for a sub-workflow step.
    ///
    /// # Returns
    /// The child instance's id.
    ///
    /// # Errors
    /// This function errors if the workflow is unknown, inactive or invalid.
    pub async fn start_child(
        self: &Arc<Self>,
        workflow_id: &str,
        version: Option<&str>,
        input: Value,
        parent_instance_id: &str,
        parent_step_id: &str,
        correlation_id: Option<String>,
    ) -> Result<String, Error> {
        let instance: WorkflowInstance = self
            .start_inner(workflow_id, version, input, None, correlation_id, Some(parent_instance_id.into()), Some(parent_step_id.into()))
            .await?;
        Ok(instance.id)
    }

    /// The shared start path.
    #[allow(clippy::too_many_arguments)]
    async fn start_inner(
        self: &Arc<Self>,
        workflow_id: &str,
        version: Option<&str>,
        input: Value,
        trigger_id: Option<String>,
        correlation_id: Option<String>,
        parent_instance_id: Option<String>,
        parent_step_id: Option<String>,
    ) -> Result<WorkflowInstance, Error> {
        let definition: WorkflowDefinition = self.definitions.get(workflow_id, version).await?;
        if !definition.is_active {
            return Err(Error::WorkflowInactive { id: workflow_id.into() });
        }
        definition.validate()?;

        // Build the instance: defaults overlaid by the input's fields, input exposed as `input`
        let mut instance: WorkflowInstance = WorkflowInstance::new(&definition.id, &definition.version, input.clone());
        instance.trigger_id = trigger_id;
        instance.correlation_id = correlation_id;
        instance.parent_instance_id = parent_instance_id;
        instance.parent_step_id = parent_step_id;
        instance.variables = definition.variables.clone();
        if let Value::Object(fields) = &input {
            for (key, value) in fields {
                instance.variables.insert(key.clone(), value.clone());
            }
        }
        instance.variables.insert(INPUT_VARIABLE.into(), input);
        for step in &definition.steps {
            instance.step_instances.insert(step.id.clone(), StepInstance::new(&step.id));
        }
        self.instances.save(instance.clone()).await?;

        // Hand it to a runner task
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel: CancellationToken = CancellationToken::new();
        self.running.insert(instance.id.clone(), RunnerHandle { tx: tx.clone(), cancel: cancel.clone() });
        let runner: Runner = Runner {
            engine: self.clone(),
            definition,
            instance: instance.clone(),
            tx,
            rx,
            cancel,
            approvals: HashMap::new(),
            retry_holds: HashSet::new(),
        };
        let engine: Arc<Self> = self.clone();
        let instance_id: String = instance.id.clone();
        tokio::spawn(async move {
            runner.run().await;
            engine.running.remove(&instance_id);
        });

        Ok(instance)
    }

    /// Delivers an external event to a parked wait-for-event step.
    ///
    /// # Errors
    /// This function errors if the instance is not live or the step is not waiting.
    pub fn complete_event(&self, instance_id: &str, step_id: &str, payload: Value) -> Result<(), Error> {
        let handle = self.running.get(instance_id).ok_or_else(|| Error::InstanceNotLive { id: instance_id.into() })?;
        handle
            .tx
            .send(RunnerMsg::Event { step_id: step_id.into(), payload })
            .map_err(|_| Error::InstanceNotLive { id: instance_id.into() })
    }

    /// Delivers an approval decision to a parked approval step.
    ///
    /// # Errors
    /// This function errors if the instance is not live.
    pub fn approve(&self, instance_id: &str, step_id: &str, approved: bool) -> Result<(), Error> {
        let handle = self.running.get(instance_id).ok_or_else(|| Error::InstanceNotLive { id: instance_id.into() })?;
        handle
            .tx
            .send(RunnerMsg::Approval { step_id: step_id.into(), approved })
            .map_err(|_| Error::InstanceNotLive { id: instance_id.into() })
    }

    /// Cancels a live instance (cascading to its steps, jobs and sub-workflows).
    ///
    /// Cancelling an already-terminal instance is a no-op.
    ///
    /// # Errors
    /// This function errors if the instance is unknown.
    pub async fn cancel(&self, instance_id: &str, reason: Option<String>) -> Result<(), Error> {
        if let Some(handle) = self.running.get(instance_id) {
            let _ = handle.tx.send(RunnerMsg::Cancel { reason });
            return Ok(());
        }

        // Not live: fine if it already ended, an error otherwise
        match self.instances.get(instance_id).await? {
            Some(instance) if instance.is_terminal() => Ok(()),
            Some(_) => Err(Error::InstanceNotLive { id: instance_id.into() }),
            None => Err(Error::Repository { err: crate::errors::WorkflowRepoError::UnknownInstance { id: instance_id.into() } }),
        }
    }

    /// Fans an event out to every matching parked wait-for-event step.
    ///
    /// # Arguments
    /// - `event_type`: The event's type.
    /// - `payload`: The event's payload, matched against correlation keys.
    ///
    /// # Returns
    /// How many steps were resumed.
    pub fn deliver_event(&self, event_type: &str, payload: &Value) -> usize {
        let matched: Vec<WaitRegistration> = {
            let mut regs = match self.waits.get_mut(event_type) {
                Some(regs) => regs,
                None => return 0,
            };
            let (matched, rest): (Vec<WaitRegistration>, Vec<WaitRegistration>) = regs.drain(..).partition(|reg| reg.matches(payload));
            *regs = rest;
            matched
        };

        let mut resumed: usize = 0;
        for reg in matched {
            if let Some(handle) = self.running.get(&reg.instance_id) {
                if handle.tx.send(RunnerMsg::Event { step_id: reg.step_id.clone(), payload: payload.clone() }).is_ok() {
                    resumed += 1;
                }
            }
        }
        resumed
    }

    /// Registers a parked wait-for-event step.
    fn register_wait(&self, event_type: &str, registration: WaitRegistration) { self.waits.entry(event_type.into()).or_default().push(registration); }

    /// Removes a parked wait-for-event step's registration.
    fn unregister_wait(&self, event_type: &str, instance_id: &str, step_id: &str) {
        if let Some(mut regs) = self.waits.get_mut(event_type) {
            regs.retain(|reg| !(reg.instance_id == instance_id && reg.step_id == step_id));
        }
    }
}



/// The single-writer task driving one instance.
struct Runner {
    /// The engine (for executors, waits and events).
    engine: Arc<WorkflowEngine>,
    /// The definition being run.
    definition: WorkflowDefinition,
    /// The instance state; this task is its only writer while it lives.
    instance: WorkflowInstance,
    /// Clone handed to executor subtasks.
    tx: mpsc::UnboundedSender<RunnerMsg>,
    /// The message inbox.
    rx: mpsc::UnboundedReceiver<RunnerMsg>,
    /// Cancelled to stop all executors of this instance.
    cancel: CancellationToken,
    /// Approval tally per waiting approval step.
    approvals: HashMap<String, u32>,
    /// Steps whose retry delay has not elapsed yet.
    retry_holds: HashSet<String>,
}

impl Runner {
    /// Drives the instance to a terminal state.
    async fn run(mut self) {
        info!("Instance '{}' of workflow '{}' starting", self.instance.id, self.instance.workflow_id);
        self.instance.status = InstanceStatus::Running;
        self.instance.started_at = Some(Utc::now());
        self.persist().await;
        self.emit(WorkflowEvent::InstanceStarted { instance_id: self.instance.id.clone(), workflow_id: self.instance.workflow_id.clone() });

        let deadline: Option<tokio::time::Instant> = self.definition.timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            self.schedule();
            self.persist().await;

            if self.all_terminal() {
                self.finish().await;
                break;
            }

            // Park the instance when nothing runs but something waits
            let any_running: bool = self.instance.step_instances.values().any(|si| si.status == StepStatus::Running);
            let any_waiting: bool = self.instance.step_instances.values().any(|si| si.status.is_waiting());
            if !any_running && any_waiting && self.instance.status != InstanceStatus::Paused {
                debug!("Instance '{}' paused", self.instance.id);
                self.instance.status = InstanceStatus::Paused;
                self.persist().await;
            }
            if !any_running && !any_waiting && self.retry_holds.is_empty() && !self.all_terminal() && !self.any_schedulable() {
                // Nothing can make progress anymore; end it rather than hang
                self.fail_instance("no runnable steps remain".into()).await;
                break;
            }

            // Wait for the next message (or the instance deadline)
            let msg: Option<RunnerMsg> = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        msg = self.rx.recv() => msg,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.end_instance(InstanceStatus::TimedOut, "instance timeout exceeded".into()).await;
                            break;
                        },
                    }
                },
                None => self.rx.recv().await,
            };
            let msg: RunnerMsg = match msg {
                Some(msg) => msg,
                // The engine is gone; stop quietly
                None => break,
            };

            if let ControlFlow::Break(_) = self.handle(msg).await {
                break;
            }
        }
    }

    /// Handles one runner message.
    async fn handle(&mut self, msg: RunnerMsg) -> ControlFlow<()> {
        match msg {
            RunnerMsg::StepDone { step_id, report } => self.handle_step_done(step_id, report).await,

            RunnerMsg::StepRetry { step_id } => {
                self.retry_holds.remove(&step_id);
                if let Some(si) = self.instance.step_instances.get_mut(&step_id) {
                    si.status = StepStatus::Pending;
                }
                ControlFlow::Continue(())
            },

            RunnerMsg::WaitTimeout { step_id } => {
                let waiting: bool = self.instance.step_instances.get(&step_id).map(|si| si.status.is_waiting()).unwrap_or(false);
                if waiting {
                    debug!("Wait step '{step_id}' of instance '{}' timed out; skipping", self.instance.id);
                    self.drop_wait_registration(&step_id);
                    let si: &mut StepInstance = self.instance.step_instances.get_mut(&step_id).unwrap();
                    si.status = StepStatus::Skipped;
                    si.completed_at = Some(Utc::now());
                    if self.instance.status == InstanceStatus::Paused {
                        self.instance.status = InstanceStatus::Running;
                    }
                }
                ControlFlow::Continue(())
            },

            RunnerMsg::Event { step_id, payload } => {
                let waiting: bool =
                    self.instance.step_instances.get(&step_id).map(|si| si.status == StepStatus::WaitingForEvent).unwrap_or(false);
                if !waiting {
                    debug!("Dropping event for step '{step_id}' of instance '{}': not waiting", self.instance.id);
                    return ControlFlow::Continue(());
                }
                self.drop_wait_registration(&step_id);
                self.complete_step(&step_id, payload);
                if self.instance.status == InstanceStatus::Paused {
                    self.instance.status = InstanceStatus::Running;
                }
                ControlFlow::Continue(())
            },

            RunnerMsg::Approval { step_id, approved } => {
                let waiting: bool =
                    self.instance.step_instances.get(&step_id).map(|si| si.status == StepStatus::WaitingForApproval).unwrap_or(false);
                if !waiting {
                    return ControlFlow::Continue(());
                }

                if !approved {
                    let step: WorkflowStep = match self.definition.step(&step_id) {
                        Some(step) => step.clone(),
                        None => return ControlFlow::Continue(()),
                    };
                    if self.instance.status == InstanceStatus::Paused {
                        self.instance.status = InstanceStatus::Running;
                    }
                    return self.handle_step_failure(&step, "approval rejected".into(), false).await;
                }

                let required: u32 = match self.definition.step(&step_id).map(|step| &step.config) {
                    Some(StepConfig::Approval { required_approvals, .. }) => (*required_approvals).max(1),
                    _ => 1,
                };
                let count: &mut u32 = self.approvals.entry(step_id.clone()).or_insert(0);
                *count += 1;
                if *count >= required {
                    let count: u32 = *count;
                    self.complete_step(&step_id, serde_json::json!({ "approved": true, "approvals": count }));
                    if self.instance.status == InstanceStatus::Paused {
                        self.instance.status = InstanceStatus::Running;
                    }
                }
                ControlFlow::Continue(())
            },

            RunnerMsg::Cancel { reason } => {
                self.end_instance(InstanceStatus::Cancelled, reason.unwrap_or_else(|| "cancelled".into())).await;
                ControlFlow::Break(())
            },
        }
    }

    /// Handles an executor's report.
    async fn handle_step_done(&mut self, step_id: String, report: StepReport) -> ControlFlow<()> {
        let step: WorkflowStep = match self.definition.step(&step_id) {
            Some(step) => step.clone(),
            None => {
                warn!("Dropping report for unknown step '{step_id}' of instance '{}'", self.instance.id);
                return ControlFlow::Continue(());
            },
        };

        // Book the executor's bookkeeping first
        {
            let si: &mut StepInstance = self.instance.step_instances.get_mut(&step_id).unwrap();
            if !report.branches.is_empty() {
                si.branches = report.branches;
            }
            if report.job_id.is_some() {
                si.job_id = report.job_id;
            }
            if report.sub_workflow_instance_id.is_some() {
                si.sub_workflow_instance_id = report.sub_workflow_instance_id;
            }
        }

        match report.outcome {
            StepOutcome::Completed { output } => {
                self.complete_step(&step_id, output);
                ControlFlow::Continue(())
            },
            StepOutcome::Failed { error } => self.handle_step_failure(&step, error, false).await,
            StepOutcome::TimedOut { error } => self.handle_step_failure(&step, error, true).await,
            StepOutcome::Cancelled => {
                // A lone cancelled step (not instance teardown) counts as a failure
                if self.cancel.is_cancelled() {
                    let si: &mut StepInstance = self.instance.step_instances.get_mut(&step_id).unwrap();
                    si.status = StepStatus::Cancelled;
                    si.completed_at = Some(Utc::now());
                    ControlFlow::Continue(())
                } else {
                    self.handle_step_failure(&step, "cancelled".into(), false).await
                }
            },
            StepOutcome::WaitingForEvent { event_type, correlation_key, timeout } => {
                let si: &mut StepInstance = self.instance.step_instances.get_mut(&step_id).unwrap();
                si.status = StepStatus::WaitingForEvent;
                self.engine.register_wait(&event_type, WaitRegistration {
                    instance_id: self.instance.id.clone(),
                    step_id: step_id.clone(),
                    correlation_key,
                    expected: self.instance.correlation_id.clone(),
                });
                if let Some(timeout) = timeout {
                    self.spawn_wait_timer(step_id, timeout);
                }
                ControlFlow::Continue(())
            },
            StepOutcome::WaitingForApproval { timeout, .. } => {
                let si: &mut StepInstance = self.instance.step_instances.get_mut(&step_id).unwrap();
                si.status = StepStatus::WaitingForApproval;
                self.approvals.insert(step_id.clone(), 0);
                if let Some(timeout) = timeout {
                    self.spawn_wait_timer(step_id, timeout);
                }
                ControlFlow::Continue(())
            },
        }
    }

    /// Marks a step completed, writing its output variable and emitting the step event.
    fn complete_step(&mut self, step_id: &str, output: Value) {
        let output_variable: Option<String> = self.definition.step(step_id).and_then(|step| step.output_variable.clone());
        let si: &mut StepInstance = self.instance.step_instances.get_mut(step_id).unwrap();
        si.status = StepStatus::Completed;
        si.completed_at = Some(Utc::now());
        si.output = Some(output.clone());
        if let Some(var) = output_variable {
            self.instance.variables.insert(var, output);
        }
        self.emit(WorkflowEvent::StepCompleted { instance_id: self.instance.id.clone(), step_id: step_id.into() });
    }

    /// Handles a terminal step failure: retry budget first, then the error strategy.
    async fn handle_step_failure(&mut self, step: &WorkflowStep, error: String, timed_out: bool) -> ControlFlow<()> {
        let retry_count: u32 = self.instance.step_instances.get(&step.id).map(|si| si.retry_count).unwrap_or(0);
        if retry_count < step.max_retries {
            // Budget remains: hold the step until its retry delay elapsed
            debug!("Step '{}' of instance '{}' failed ('{}'); retrying ({}/{})", step.id, self.instance.id, error, retry_count + 1, step.max_retries);
            let si: &mut StepInstance = self.instance.step_instances.get_mut(&step.id).unwrap();
            si.retry_count += 1;
            si.status = StepStatus::Pending;
            si.error = Some(error);
            match step.retry_delay {
                Some(delay) => {
                    self.retry_holds.insert(step.id.clone());
                    let tx: mpsc::UnboundedSender<RunnerMsg> = self.tx.clone();
                    let step_id: String = step.id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(RunnerMsg::StepRetry { step_id });
                    });
                },
                None => {},
            }
            return ControlFlow::Continue(());
        }

        // Budget exhausted: record the failure
        {
            let si: &mut StepInstance = self.instance.step_instances.get_mut(&step.id).unwrap();
            si.status = if timed_out { StepStatus::TimedOut } else { StepStatus::Failed };
            si.error = Some(error.clone());
            si.completed_at = Some(Utc::now());
        }
        warn!("Step '{}' of instance '{}' failed terminally: {error}", step.id, self.instance.id);

        // Tolerated failures keep the instance going
        if step.continue_on_error || self.definition.error_strategy == ErrorStrategy::ContinueOnError {
            return ControlFlow::Continue(());
        }
        match self.definition.error_strategy {
            ErrorStrategy::StopOnFirst => {
                self.fail_instance(error).await;
                ControlFlow::Break(())
            },
            ErrorStrategy::Compensate => {
                self.compensate().await;
                self.fail_instance(error).await;
                ControlFlow::Break(())
            },
            ErrorStrategy::ContinueOnError => ControlFlow::Continue(()),
        }
    }

    /// Schedules every runnable step: dependency gating, condition evaluation, executor
    /// spawning.
    fn schedule(&mut self) {
        let steps: Vec<WorkflowStep> = self.definition.steps.clone();
        for step in steps {
            let status: StepStatus = self.instance.step_instances[&step.id].status;
            if !matches!(status, StepStatus::Pending | StepStatus::WaitingForDependencies) || self.retry_holds.contains(&step.id) {
                continue;
            }

            // Dependency gating
            let mut blocked: bool = false;
            let mut doomed: bool = false;
            for dependency in &step.depends_on {
                let dep_status: StepStatus = self.instance.step_instances[dependency].status;
                if dep_status.satisfies_dependents() {
                    continue;
                }
                if dep_status.is_terminal() {
                    doomed = true;
                } else {
                    blocked = true;
                }
            }
            if doomed {
                let si: &mut StepInstance = self.instance.step_instances.get_mut(&step.id).unwrap();
                si.status = StepStatus::Skipped;
                si.error = Some("a dependency did not complete".into());
                si.completed_at = Some(Utc::now());
                continue;
            }
            if blocked {
                self.instance.step_instances.get_mut(&step.id).unwrap().status = StepStatus::WaitingForDependencies;
                continue;
            }

            // Condition gating
            if let Some(condition) = &step.condition {
                match expression::evaluate_bool(condition, &self.instance.variables) {
                    Ok(true) => {},
                    Ok(false) => {
                        let si: &mut StepInstance = self.instance.step_instances.get_mut(&step.id).unwrap();
                        si.status = StepStatus::Skipped;
                        si.completed_at = Some(Utc::now());
                        continue;
                    },
                    Err(err) => {
                        // Let the failure path deal with it uniformly
                        self.instance.step_instances.get_mut(&step.id).unwrap().status = StepStatus::Running;
                        let _ = self.tx.send(RunnerMsg::StepDone {
                            step_id: step.id.clone(),
                            report: StepReport {
                                outcome: StepOutcome::Failed { error: format!("condition failed to evaluate: {err}") },
                                branches: Vec::new(),
                                job_id: None,
                                sub_workflow_instance_id: None,
                            },
                        });
                        continue;
                    },
                }
            }

            // Run it
            let attempt: u32 = {
                let si: &mut StepInstance = self.instance.step_instances.get_mut(&step.id).unwrap();
                si.status = StepStatus::Running;
                si.started_at.get_or_insert_with(Utc::now);
                si.retry_count
            };
            self.emit(WorkflowEvent::StepStarted { instance_id: self.instance.id.clone(), step_id: step.id.clone() });

            let ctx: ExecutorContext = ExecutorContext {
                engine: self.engine.clone(),
                instance_id: self.instance.id.clone(),
                step_id: step.id.clone(),
                correlation_id: self.instance.correlation_id.clone(),
                variables: self.instance.variables.clone(),
                cancel: self.cancel.clone(),
                attempt,
            };
            let tx: mpsc::UnboundedSender<RunnerMsg> = self.tx.clone();
            let step_id: String = step.id.clone();
            tokio::spawn(async move {
                let report: StepReport = executors::execute_step(ctx, step).await;
                let _ = tx.send(RunnerMsg::StepDone { step_id, report });
            });
        }
    }

    /// Returns whether any step could still be scheduled.
    fn any_schedulable(&self) -> bool {
        self.instance.step_instances.values().any(|si| matches!(si.status, StepStatus::Pending | StepStatus::WaitingForDependencies))
    }

    /// Returns whether every top-level step is terminal.
    fn all_terminal(&self) -> bool { self.instance.step_instances.values().all(|si| si.status.is_terminal()) }

    /// Wraps the instance up successfully.
    async fn finish(&mut self) {
        // The output convention: the `output` variable when set, else the last completed
        // step's output
        let output: Option<Value> = match self.instance.variables.get("output") {
            Some(output) => Some(output.clone()),
            None => self
                .instance
                .step_instances
                .values()
                .filter(|si| si.status == StepStatus::Completed)
                .max_by_key(|si| si.completed_at)
                .and_then(|si| si.output.clone()),
        };

        self.instance.status = InstanceStatus::Completed;
        self.instance.output = output;
        self.instance.completed_at = Some(Utc::now());
        self.persist().await;
        info!("Instance '{}' of workflow '{}' completed", self.instance.id, self.instance.workflow_id);
        self.emit(WorkflowEvent::InstanceCompleted { instance_id: self.instance.id.clone(), workflow_id: self.instance.workflow_id.clone() });
    }

    /// Ends the instance as Failed.
    async fn fail_instance(&mut self, error: String) { self.end_instance(InstanceStatus::Failed, error).await }

    /// Ends the instance in the given terminal state, cancelling everything still in flight.
    async fn end_instance(&mut self, status: InstanceStatus, error: String) {
        // Stop all executors; job/sub-workflow executors cancel their jobs and children on
        // the way out
        self.cancel.cancel();

        for si in self.instance.step_instances.values_mut() {
            if !si.status.is_terminal() {
                if si.status == StepStatus::WaitingForEvent {
                    // Drop the wait registration for this step
                    if let Some(StepConfig::WaitForEvent { event_type, .. }) =
                        self.definition.steps.iter().find(|step| step.id == si.step_id).map(|step| &step.config)
                    {
                        self.engine.unregister_wait(event_type, &self.instance.id, &si.step_id);
                    }
                }
                si.status = StepStatus::Cancelled;
                si.completed_at = Some(Utc::now());
            }
        }

        self.instance.status = status;
        self.instance.error = Some(error.clone());
        self.instance.completed_at = Some(Utc::now());
        self.persist().await;
        warn!("Instance '{}' of workflow '{}' ended: {:?} ({error})", self.instance.id, self.instance.workflow_id, status);
        self.emit(WorkflowEvent::InstanceFailed { instance_id: self.instance.id.clone(), workflow_id: self.instance.workflow_id.clone(), error });
    }

    /// Runs the compensation of every completed step, in reverse completion order.
    async fn compensate(&mut self) {
        info!("Instance '{}' compensating", self.instance.id);
        self.instance.status = InstanceStatus::Compensating;
        self.persist().await;

        // Completion order is topology-respecting, so its reverse is safe to undo in
        let mut completed: Vec<StepInstance> =
            self.instance.step_instances.values().filter(|si| si.status == StepStatus::Completed).cloned().collect();
        completed.sort_by_key(|si| std::cmp::Reverse(si.completed_at));

        for si in completed {
            let step: &WorkflowStep = match self.definition.step(&si.step_id) {
                Some(step) => step,
                None => continue,
            };
            let compensation: WorkflowStep = match &step.compensation {
                Some(compensation) => (**compensation).clone(),
                None => continue,
            };

            self.instance.step_instances.get_mut(&si.step_id).unwrap().status = StepStatus::Compensating;
            self.persist().await;

            let ctx: ExecutorContext = ExecutorContext {
                engine: self.engine.clone(),
                instance_id: self.instance.id.clone(),
                step_id: compensation.id.clone(),
                correlation_id: self.instance.correlation_id.clone(),
                variables: self.instance.variables.clone(),
                cancel: CancellationToken::new(),
                attempt: 0,
            };
            let report: StepReport = executors::execute_step(ctx, compensation.clone()).await;

            let mut comp_state: StepInstance = StepInstance::new(&compensation.id);
            comp_state.started_at = Some(Utc::now());
            comp_state.completed_at = Some(Utc::now());
            let si: &mut StepInstance = self.instance.step_instances.get_mut(&si.step_id).unwrap();
            match report.outcome {
                StepOutcome::Completed { output } => {
                    comp_state.status = StepStatus::Completed;
                    comp_state.output = Some(output);
                    si.status = StepStatus::Compensated;
                },
                other => {
                    let error: String = format!("compensation did not complete: {other:?}");
                    error!("Step '{}' of instance '{}': {error}", si.step_id, self.instance.id);
                    comp_state.status = StepStatus::Failed;
                    comp_state.error = Some(error);
                    // The original step keeps its Completed status; the failed undo is
                    // recorded on the side
                    si.status = StepStatus::Completed;
                },
            }
            si.compensation = Some(Box::new(comp_state));
            self.persist().await;
        }
    }

    /// Spawns a timer that skips a wait step when its window elapses.
    fn spawn_wait_timer(&self, step_id: String, timeout: std::time::Duration) {
        let tx: mpsc::UnboundedSender<RunnerMsg> = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(RunnerMsg::WaitTimeout { step_id });
        });
    }

    /// Drops the engine-level wait registration of the given step, if it has one.
    fn drop_wait_registration(&self, step_id: &str) {
        if let Some(StepConfig::WaitForEvent { event_type, .. }) = self.definition.step(step_id).map(|step| &step.config) {
            self.engine.unregister_wait(event_type, &self.instance.id, step_id);
        }
    }

    /// Persists the current instance snapshot.
    async fn persist(&self) {
        if let Err(err) = self.engine.instances.save(self.instance.clone()).await {
            error!("Failed to persist instance '{}': {err}", self.instance.id);
        }
    }

    /// Publishes an engine event.
    fn emit(&self, event: WorkflowEvent) { let _ = self.engine.events.send(event); }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use orbitmesh_tsk::manager::{JobManager, JobManagerConfig};
    use orbitmesh_tsk::repository::MemJobRepository;
    use specifications::jobs::{JobResult, JobStatus};

    use crate::executors::LogNotifier;
    use crate::repository::{MemInstanceRepository, MemWorkflowRepository};
    use crate::workflow::{TriggerDefinition, TriggerKind};

    use super::*;

    /// Builds an engine over fresh in-memory stores.
    fn engine() -> Arc<WorkflowEngine> {
        let jobs: Arc<JobManager> = Arc::new(JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig::default()));
        Arc::new(WorkflowEngine::new(
            Arc::new(MemWorkflowRepository::new()),
            Arc::new(MemInstanceRepository::new()),
            jobs,
            Arc::new(LogNotifier),
        ))
    }

    /// Spawns a simulated node: picks up queued jobs and behaves per command. `echo` returns
    /// the parameters, `fail` always fails, `flaky-once` fails on first sight only, `hang`
    /// acknowledges and never reports.
    fn spawn_node(engine: &Arc<WorkflowEngine>) {
        let jobs: Arc<JobManager> = engine.jobs().clone();
        tokio::spawn(async move {
            let offer: std::collections::HashSet<String> = std::collections::HashSet::new();
            let mut seen_flaky: u32 = 0;
            loop {
                let job = match jobs.dequeue_next(&offer, &offer).await {
                    Ok(Some(job)) => job,
                    _ => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    },
                };
                let id: String = job.id().to_string();
                let _ = jobs.assign(&id, "sim-node").await;
                let _ = jobs.acknowledge(&id, "sim-node").await;
                match job.request.command.as_str() {
                    "fail" => {
                        let _ = jobs.fail(&id, "boom", None).await;
                    },
                    "flaky-once" => {
                        seen_flaky += 1;
                        if seen_flaky == 1 {
                            let _ = jobs.fail(&id, "first attempt fails", None).await;
                        } else {
                            let _ = jobs.complete(&id, JobResult::completed(&id, job.request.parameters.clone(), Duration::ZERO)).await;
                        }
                    },
                    "hang" => {},
                    _ => {
                        let _ = jobs.complete(&id, JobResult::completed(&id, job.request.parameters.clone(), Duration::ZERO)).await;
                    },
                }
            }
        });
    }

    /// Stores a definition built around the given steps.
    async fn store(engine: &Arc<WorkflowEngine>, id: &str, steps: Vec<WorkflowStep>, strategy: ErrorStrategy, variables: HashMap<String, Value>) {
        let definition: WorkflowDefinition = WorkflowDefinition {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            description: String::new(),
            steps,
            triggers: vec![TriggerDefinition {
                id: format!("{id}-manual"),
                kind: TriggerKind::Manual { input_schema: Vec::new() },
                input_mapping: HashMap::new(),
                enabled: true,
            }],
            variables,
            timeout: None,
            max_retries: 0,
            error_strategy: strategy,
            is_active: true,
        };
        engine.definitions().store(definition).await.unwrap();
    }

    /// Polls until the instance is terminal (or the test times out).
    async fn await_terminal(engine: &Arc<WorkflowEngine>, instance_id: &str) -> WorkflowInstance {
        for _ in 0..200 {
            if let Some(instance) = engine.instances().get(instance_id).await.unwrap() {
                if instance.is_terminal() {
                    return instance;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Instance '{instance_id}' did not reach a terminal state in time");
    }

    /// Polls until the instance reports the given status.
    async fn await_status(engine: &Arc<WorkflowEngine>, instance_id: &str, status: InstanceStatus) {
        for _ in 0..200 {
            if let Some(instance) = engine.instances().get(instance_id).await.unwrap() {
                if instance.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Instance '{instance_id}' did not reach {status:?} in time");
    }

    /// Builds a job step echoing the given parameters.
    fn echo_step(id: &str, parameters: Value) -> WorkflowStep {
        WorkflowStep::new(id, StepConfig::Job {
            command: "echo".into(),
            parameters,
            priority: 0,
            required_capabilities: Default::default(),
            required_tags: Default::default(),
            target_agent_id: None,
            timeout: None,
        })
    }

    #[tokio::test]
    async fn test_job_step_completes_with_resolved_parameters() {
        let engine: Arc<WorkflowEngine> = engine();
        spawn_node(&engine);

        let mut step: WorkflowStep = echo_step("j1", serde_json::json!({"text": "${greeting}"}));
        step.output_variable = Some("res".into());
        store(&engine, "wf", vec![step], ErrorStrategy::StopOnFirst, HashMap::from([("greeting".to_string(), serde_json::json!("hi"))])).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Completed);
        let si: &StepInstance = &done.step_instances["j1"];
        assert_eq!(si.status, StepStatus::Completed);
        assert_eq!(si.output, Some(serde_json::json!({"text": "hi"})));
        assert!(si.job_id.is_some());
        assert_eq!(done.output, Some(serde_json::json!({"text": "hi"})));
        assert_eq!(done.variables.get("res"), Some(&serde_json::json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn test_transform_and_conditional_branches() {
        let engine: Arc<WorkflowEngine> = engine();

        let mut copy: WorkflowStep = WorkflowStep::new("copy", StepConfig::Transform { expression: "count".into() });
        copy.output_variable = Some("copied".into());
        let mut cond: WorkflowStep = WorkflowStep::new("cond", StepConfig::Conditional {
            expression: "copied == 3".into(),
            then_steps: vec![WorkflowStep::new("then", StepConfig::Transform { expression: "'yes'".into() })],
            else_steps: vec![WorkflowStep::new("else", StepConfig::Transform { expression: "'no'".into() })],
        });
        cond.depends_on = vec!["copy".into()];
        store(&engine, "wf", vec![copy, cond], ErrorStrategy::StopOnFirst, HashMap::from([("count".to_string(), serde_json::json!(3))])).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.step_instances["cond"].output, Some(serde_json::json!("yes")));
        // The then-branch ran, the else-branch did not
        let branch = &done.step_instances["cond"].branches[0];
        assert_eq!(branch.steps["then"].status, StepStatus::Completed);
        assert!(!branch.steps.contains_key("else"));
    }

    #[tokio::test]
    async fn test_step_retry_then_success() {
        let engine: Arc<WorkflowEngine> = engine();
        spawn_node(&engine);

        let mut step: WorkflowStep = WorkflowStep::new("flaky", StepConfig::Job {
            command: "flaky-once".into(),
            parameters: serde_json::json!({"ok": true}),
            priority: 0,
            required_capabilities: Default::default(),
            required_tags: Default::default(),
            target_agent_id: None,
            timeout: None,
        });
        step.max_retries = 1;
        store(&engine, "wf", vec![step], ErrorStrategy::StopOnFirst, HashMap::new()).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Completed);
        let si: &StepInstance = &done.step_instances["flaky"];
        assert_eq!(si.status, StepStatus::Completed);
        assert_eq!(si.retry_count, 1);
    }

    #[tokio::test]
    async fn test_compensation_runs_in_reverse_order() {
        let engine: Arc<WorkflowEngine> = engine();
        spawn_node(&engine);

        let a: WorkflowStep = echo_step("a", serde_json::json!({"step": "a"}));
        let mut b: WorkflowStep = echo_step("b", serde_json::json!({"step": "b"}));
        b.depends_on = vec!["a".into()];
        b.compensation = Some(Box::new(echo_step("undo-b", serde_json::json!({"undo": "b"}))));
        let mut c: WorkflowStep = WorkflowStep::new("c", StepConfig::Job {
            command: "fail".into(),
            parameters: Value::Null,
            priority: 0,
            required_capabilities: Default::default(),
            required_tags: Default::default(),
            target_agent_id: None,
            timeout: None,
        });
        c.depends_on = vec!["b".into()];
        store(&engine, "wf", vec![a, b, c], ErrorStrategy::Compensate, HashMap::new()).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Failed);
        assert_eq!(done.step_instances["a"].status, StepStatus::Completed);
        assert_eq!(done.step_instances["b"].status, StepStatus::Compensated);
        assert_eq!(done.step_instances["c"].status, StepStatus::Failed);
        let compensation: &StepInstance = done.step_instances["b"].compensation.as_ref().unwrap();
        assert_eq!(compensation.status, StepStatus::Completed);
        assert_eq!(compensation.output, Some(serde_json::json!({"undo": "b"})));
    }

    #[tokio::test]
    async fn test_foreach_aggregates_in_order() {
        let engine: Arc<WorkflowEngine> = engine();
        spawn_node(&engine);

        let inner: WorkflowStep = echo_step("echo-item", serde_json::json!({"value": "${item}"}));
        let step: WorkflowStep = WorkflowStep::new("fan", StepConfig::ForEach {
            collection: "items".into(),
            item_variable: "item".into(),
            index_variable: Some("idx".into()),
            steps: vec![inner],
        });
        store(&engine, "wf", vec![step], ErrorStrategy::StopOnFirst, HashMap::from([("items".to_string(), serde_json::json!([1, 2, 3]))])).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Completed);
        let si: &StepInstance = &done.step_instances["fan"];
        assert_eq!(si.status, StepStatus::Completed);
        assert_eq!(si.output, Some(serde_json::json!([{"value": 1}, {"value": 2}, {"value": 3}])));
        assert_eq!(si.branches.len(), 3);
    }

    #[tokio::test]
    async fn test_parallel_completes_all_branches() {
        let engine: Arc<WorkflowEngine> = engine();

        let children: Vec<WorkflowStep> = (0..3)
            .map(|i| WorkflowStep::new(format!("t{i}"), StepConfig::Transform { expression: format!("'{i}'") }))
            .collect();
        let step: WorkflowStep = WorkflowStep::new("par", StepConfig::Parallel { steps: children, max_concurrency: 2, fail_fast: false });
        store(&engine, "wf", vec![step], ErrorStrategy::StopOnFirst, HashMap::new()).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Completed);
        let si: &StepInstance = &done.step_instances["par"];
        assert_eq!(si.output, Some(serde_json::json!(["0", "1", "2"])));
        assert_eq!(si.branches.len(), 3);
    }

    #[tokio::test]
    async fn test_wait_for_event_pauses_and_resumes() {
        let engine: Arc<WorkflowEngine> = engine();

        let step: WorkflowStep = WorkflowStep::new("wait", StepConfig::WaitForEvent {
            event_type: "approved".into(),
            correlation_key: Some("$.id".into()),
            timeout: Some(Duration::from_secs(3600)),
        });
        store(&engine, "wf", vec![step], ErrorStrategy::StopOnFirst, HashMap::new()).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, Some("x".into())).await.unwrap();
        await_status(&engine, &instance.id, InstanceStatus::Paused).await;

        // A non-matching correlation resumes nothing
        assert_eq!(engine.deliver_event("approved", &serde_json::json!({"id": "y"})), 0);
        // The matching one does
        assert_eq!(engine.deliver_event("approved", &serde_json::json!({"id": "x"})), 1);

        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.step_instances["wait"].status, StepStatus::Completed);
        assert_eq!(done.step_instances["wait"].output, Some(serde_json::json!({"id": "x"})));
    }

    #[tokio::test]
    async fn test_approval_n_of_m() {
        let engine: Arc<WorkflowEngine> = engine();

        let step: WorkflowStep = WorkflowStep::new("gate", StepConfig::Approval {
            approvers: vec!["alice".into(), "bob".into(), "carol".into()],
            required_approvals: 2,
            message: "release?".into(),
            timeout: None,
        });
        store(&engine, "wf", vec![step], ErrorStrategy::StopOnFirst, HashMap::new()).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();
        await_status(&engine, &instance.id, InstanceStatus::Paused).await;

        engine.approve(&instance.id, "gate", true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // One approval is not enough yet
        assert_eq!(engine.instances().get(&instance.id).await.unwrap().unwrap().status, InstanceStatus::Paused);

        engine.approve(&instance.id, "gate", true).unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.step_instances["gate"].output, Some(serde_json::json!({"approved": true, "approvals": 2})));
    }

    #[tokio::test]
    async fn test_cancel_cascades_to_steps_and_jobs() {
        let engine: Arc<WorkflowEngine> = engine();
        spawn_node(&engine);

        let step: WorkflowStep = WorkflowStep::new("stuck", StepConfig::Job {
            command: "hang".into(),
            parameters: Value::Null,
            priority: 0,
            required_capabilities: Default::default(),
            required_tags: Default::default(),
            target_agent_id: None,
            timeout: None,
        });
        store(&engine, "wf", vec![step], ErrorStrategy::StopOnFirst, HashMap::new()).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();

        // Wait until the job is out with the simulated node
        let job_id: String = loop {
            if let Some(snapshot) = engine.instances().get(&instance.id).await.unwrap() {
                if let Some(job_id) = snapshot.step_instances.get("stuck").and_then(|si| si.job_id.clone()) {
                    if let Ok(Some(job)) = engine.jobs().get(&job_id).await {
                        if job.status == JobStatus::Acknowledged {
                            break job_id;
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        engine.cancel(&instance.id, Some("operator".into())).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Cancelled);
        assert_eq!(done.step_instances["stuck"].status, StepStatus::Cancelled);
        // The dispatched job was cancelled along with the instance
        for _ in 0..100 {
            if engine.jobs().get(&job_id).await.unwrap().unwrap().status == JobStatus::Cancelled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Job '{job_id}' was not cancelled");
    }

    #[tokio::test]
    async fn test_sub_workflow_inherits_child_outcome() {
        let engine: Arc<WorkflowEngine> = engine();

        // The child computes a value
        let mut child_step: WorkflowStep = WorkflowStep::new("inner", StepConfig::Transform { expression: "$.seed".into() });
        child_step.output_variable = Some("output".into());
        store(&engine, "child", vec![child_step], ErrorStrategy::StopOnFirst, HashMap::new()).await;

        // The parent launches it and waits
        let step: WorkflowStep = WorkflowStep::new("launch", StepConfig::SubWorkflow {
            workflow_id: "child".into(),
            version: None,
            input_mapping: HashMap::from([("seed".to_string(), "42".to_string())]),
            wait_for_completion: true,
        });
        store(&engine, "parent", vec![step], ErrorStrategy::StopOnFirst, HashMap::new()).await;

        let instance: WorkflowInstance = engine.start("parent", None, Value::Null, None, None).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Completed);
        let si: &StepInstance = &done.step_instances["launch"];
        assert_eq!(si.status, StepStatus::Completed);
        assert_eq!(si.output, Some(serde_json::json!(42)));

        // The child is linked back to its parent step
        let child_id: &str = si.sub_workflow_instance_id.as_deref().unwrap();
        let child: WorkflowInstance = engine.instances().get(child_id).await.unwrap().unwrap();
        assert_eq!(child.parent_instance_id.as_deref(), Some(done.id.as_str()));
        assert_eq!(child.parent_step_id.as_deref(), Some("launch"));
    }

    #[tokio::test]
    async fn test_continue_on_error_skips_dependents() {
        let engine: Arc<WorkflowEngine> = engine();
        spawn_node(&engine);

        let bad: WorkflowStep = WorkflowStep::new("bad", StepConfig::Job {
            command: "fail".into(),
            parameters: Value::Null,
            priority: 0,
            required_capabilities: Default::default(),
            required_tags: Default::default(),
            target_agent_id: None,
            timeout: None,
        });
        let mut dependent: WorkflowStep = WorkflowStep::new("dependent", StepConfig::Transform { expression: "'never'".into() });
        dependent.depends_on = vec!["bad".into()];
        let independent: WorkflowStep = WorkflowStep::new("independent", StepConfig::Transform { expression: "'ran'".into() });
        store(&engine, "wf", vec![bad, dependent, independent], ErrorStrategy::ContinueOnError, HashMap::new()).await;

        let instance: WorkflowInstance = engine.start("wf", None, Value::Null, None, None).await.unwrap();
        let done: WorkflowInstance = await_terminal(&engine, &instance.id).await;

        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.step_instances["bad"].status, StepStatus::Failed);
        assert_eq!(done.step_instances["dependent"].status, StepStatus::Skipped);
        assert_eq!(done.step_instances["independent"].status, StepStatus::Completed);
    }
}
