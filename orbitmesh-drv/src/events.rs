//  EVENTS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the dashboard push channel: a broadcast bus of typed
//!   events, fed by forwarder tasks that translate registry, job and
//!   workflow events into the names the dashboard understands. The HTTP
//!   layer exposes the bus as an SSE stream.
//

use std::sync::Arc;

use log::debug;
use orbitmesh_exe::engine::{WorkflowEngine, WorkflowEvent};
use orbitmesh_reg::registry::{AgentEvent, NodeRegistry};
use orbitmesh_tsk::manager::JobManager;
use orbitmesh_tsk::spec::JobEvent;
use serde::Serialize;
use specifications::agents::AgentStatus;
use specifications::jobs::JobStatus;
use tokio::sync::broadcast;


/***** CONSTANTS *****/
/// The capacity of the dashboard bus. Slow dashboards lag and lose events, never block.
const BUS_CAPACITY: usize = 1024;





/***** LIBRARY *****/
/// The events pushed to dashboards. The serde tag is the event name on the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DashboardEvent {
    /// A node registered.
    AgentConnected { agent_id: String, name: String },
    /// A node's session dropped.
    AgentDisconnected { agent_id: String },
    /// A node's lifecycle state changed.
    AgentStatusChanged { agent_id: String, old: AgentStatus, new: AgentStatus },
    /// A job entered the queue.
    JobCreated { job_id: String, command: String },
    /// A job's lifecycle status changed.
    JobStatusChanged { job_id: String, old: JobStatus, new: JobStatus },
    /// A progress report arrived.
    JobProgress { job_id: String, percentage: u8, message: String },
    /// A job completed.
    JobCompleted { job_id: String },
    /// A job failed terminally.
    JobFailed { job_id: String, error: String },
    /// A workflow instance started.
    WorkflowInstanceStarted { instance_id: String, workflow_id: String },
    /// A workflow instance completed.
    WorkflowInstanceCompleted { instance_id: String, workflow_id: String },
    /// A workflow instance failed.
    WorkflowInstanceFailed { instance_id: String, workflow_id: String, error: String },
    /// A workflow step started.
    WorkflowStepStarted { instance_id: String, step_id: String },
    /// A workflow step completed.
    WorkflowStepCompleted { instance_id: String, step_id: String },
}



/// The dashboard bus itself.
#[derive(Debug)]
pub struct EventBus {
    /// The broadcast channel dashboards subscribe to.
    tx: broadcast::Sender<DashboardEvent>,
}

impl Default for EventBus {
    #[inline]
    fn default() -> Self { Self::new() }
}
impl EventBus {
    /// Constructor for the EventBus.
    #[inline]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Subscribes a dashboard to the bus.
    #[inline]
    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> { self.tx.subscribe() }

    /// Publishes an event (dropped silently when nobody listens).
    #[inline]
    pub fn publish(&self, event: DashboardEvent) {
        debug!("Dashboard event: {event:?}");
        let _ = self.tx.send(event);
    }
}



/// Spawns the forwarder tasks that translate component events onto the bus.
///
/// # Arguments
/// - `bus`: The bus to publish on.
/// - `registry`: The node registry whose events to forward.
/// - `manager`: The job manager whose events to forward.
/// - `engine`: The workflow engine whose events to forward.
pub fn spawn_forwarders(bus: Arc<EventBus>, registry: &NodeRegistry, manager: &JobManager, engine: &WorkflowEngine) {
    // Registry events
    let mut agent_rx = registry.subscribe();
    let agent_bus: Arc<EventBus> = bus.clone();
    tokio::spawn(async move {
        loop {
            match agent_rx.recv().await {
                Ok(AgentEvent::Registered { agent }) => agent_bus.publish(DashboardEvent::AgentConnected { agent_id: agent.id, name: agent.name }),
                Ok(AgentEvent::Disconnected { agent_id }) => agent_bus.publish(DashboardEvent::AgentDisconnected { agent_id }),
                Ok(AgentEvent::StatusChanged(change)) => {
                    agent_bus.publish(DashboardEvent::AgentStatusChanged { agent_id: change.agent_id, old: change.old, new: change.new })
                },
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Job events
    let mut job_rx = manager.subscribe();
    let job_bus: Arc<EventBus> = bus.clone();
    tokio::spawn(async move {
        loop {
            match job_rx.recv().await {
                Ok(JobEvent::Created { job }) => job_bus.publish(DashboardEvent::JobCreated { job_id: job.id().into(), command: job.request.command }),
                Ok(JobEvent::StatusChanged { job_id, old, new }) => job_bus.publish(DashboardEvent::JobStatusChanged { job_id, old, new }),
                Ok(JobEvent::Progress(progress)) => job_bus.publish(DashboardEvent::JobProgress {
                    job_id: progress.job_id.clone(),
                    percentage: progress.percentage(),
                    message: progress.message,
                }),
                Ok(JobEvent::Completed { job_id, .. }) => job_bus.publish(DashboardEvent::JobCompleted { job_id }),
                Ok(JobEvent::Failed { job_id, error }) => job_bus.publish(DashboardEvent::JobFailed { job_id, error }),
                Ok(JobEvent::DeadLettered { .. }) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Workflow events
    let mut wf_rx = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match wf_rx.recv().await {
                Ok(WorkflowEvent::InstanceStarted { instance_id, workflow_id }) => {
                    bus.publish(DashboardEvent::WorkflowInstanceStarted { instance_id, workflow_id })
                },
                Ok(WorkflowEvent::InstanceCompleted { instance_id, workflow_id }) => {
                    bus.publish(DashboardEvent::WorkflowInstanceCompleted { instance_id, workflow_id })
                },
                Ok(WorkflowEvent::InstanceFailed { instance_id, workflow_id, error }) => {
                    bus.publish(DashboardEvent::WorkflowInstanceFailed { instance_id, workflow_id, error })
                },
                Ok(WorkflowEvent::StepStarted { instance_id, step_id }) => bus.publish(DashboardEvent::WorkflowStepStarted { instance_id, step_id }),
                Ok(WorkflowEvent::StepCompleted { instance_id, step_id }) => {
                    bus.publish(DashboardEvent::WorkflowStepCompleted { instance_id, step_id })
                },
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_on_the_wire() {
        let event: DashboardEvent = DashboardEvent::AgentConnected { agent_id: "a1".into(), name: "node-1".into() };
        let raw: String = serde_json::to_string(&event).unwrap();
        assert!(raw.contains("\"event\":\"AgentConnected\""));

        let event: DashboardEvent = DashboardEvent::WorkflowStepCompleted { instance_id: "i1".into(), step_id: "s1".into() };
        let raw: String = serde_json::to_string(&event).unwrap();
        assert!(raw.contains("\"event\":\"WorkflowStepCompleted\""));
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus: EventBus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DashboardEvent::JobCompleted { job_id: "j1".into() });
        match rx.recv().await.unwrap() {
            DashboardEvent::JobCompleted { job_id } => assert_eq!(job_id, "j1"),
            other => panic!("Unexpected event {other:?}"),
        }
    }
}
