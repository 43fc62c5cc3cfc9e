//  DISPATCH.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the host's dispatch cycle and background sweepers. Each
//!   sweep is isolated: failures are logged and the next tick runs
//!   regardless, and every task holds only weak references so shutdown
//!   is never blocked on a sleeping sweeper.
//

use std::sync::{Arc, Weak};
use std::time::Duration;

use error_trace::ErrorTrace as _;
use log::{debug, error, info, warn};
use orbitmesh_reg::registry::NodeRegistry;
use orbitmesh_tsk::manager::JobManager;
use orbitmesh_tsk::router::{RouteRequest, Router};
use specifications::agents::AgentTrigger;
use specifications::commanding::{Command, CommandKind, ExecuteJob};
use specifications::jobs::{Job, JobStatus};
use tokio::sync::mpsc;

use crate::hub::{ConnectionHub, HubEvent};


/***** LIBRARY *****/
/// Runs one dispatch pass: for every queued job (in priority order), pick a node, assign and
/// send. Jobs with no eligible node stay pending; failed sends revert immediately.
///
/// # Returns
/// How many jobs were handed to a node in this pass.
pub async fn dispatch_once(manager: &JobManager, router: &Router, registry: &NodeRegistry, hub: &ConnectionHub) -> usize {
    let mut dispatched: usize = 0;
    for entry in manager.queue_snapshot() {
        let job: Job = match manager.get(&entry.job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Pending => job,
            // Raced with a cancel or another dispatcher; leave it be
            _ => continue,
        };

        // Pick a node
        let agent = match router.select(&RouteRequest::for_job(&job), |agent_id| manager.active_count(agent_id)) {
            Some(agent) => agent,
            None => {
                debug!("No eligible node for job '{}'; staying pending", entry.job_id);
                continue;
            },
        };

        // Assign, then send; a synchronous send failure reverts the assignment
        if let Err(err) = manager.assign(&entry.job_id, &agent.id).await {
            debug!("Skipping job '{}': {err}", entry.job_id);
            continue;
        }
        if let Err(err) = registry.apply_trigger(&agent.id, AgentTrigger::StartJob) {
            // Already Running is fine; anything else is just logged
            debug!("Skipping StartJob trigger for agent '{}': {err}", agent.id);
        }

        let command: Command = Command::new(CommandKind::Execute(ExecuteJob::from(&job.request)));
        match hub.send_to_agent(&agent.id, command) {
            Ok(_) => {
                debug!("Dispatched job '{}' to agent '{}'", entry.job_id, agent.id);
                dispatched += 1;
            },
            Err(err) => {
                warn!("Failed to send job '{}' to agent '{}': {err}; reverting", entry.job_id, agent.id);
                if let Err(err) = manager.revert_to_pending(&entry.job_id).await {
                    error!("{}", err.trace());
                }
            },
        }
    }
    dispatched
}

/// Can be run as a `tokio` background task to dispatch queued jobs periodically.
///
/// # Arguments
/// - `manager`/`router`/`registry`/`hub`: Weak handles on the host's components; the task
///   ends when any of them is dropped.
/// - `interval`: The pause between passes.
pub async fn dispatch_cycle(
    manager: Weak<JobManager>,
    router: Weak<Router>,
    registry: Weak<NodeRegistry>,
    hub: Weak<ConnectionHub>,
    interval: Duration,
) {
    debug!("Starting dispatch cycle ({interval:?})");
    loop {
        tokio::time::sleep(interval).await;
        let (manager, router, registry, hub) = match (manager.upgrade(), router.upgrade(), registry.upgrade(), hub.upgrade()) {
            (Some(manager), Some(router), Some(registry), Some(hub)) => (manager, router, registry, hub),
            _ => {
                info!("Dispatch cycle ending: host components deallocated");
                break;
            },
        };
        dispatch_once(&manager, &router, &registry, &hub).await;
    }
}

/// Can be run as a `tokio` background task to fire job timeouts and ACK deadlines.
///
/// # Arguments
/// - `manager`: Weak handle on the job manager; the task ends when it is dropped.
/// - `interval`: The pause between sweeps.
pub async fn timeout_cycle(manager: Weak<JobManager>, interval: Duration) {
    debug!("Starting timeout sweeper ({interval:?})");
    loop {
        tokio::time::sleep(interval).await;
        let manager: Arc<JobManager> = match manager.upgrade() {
            Some(manager) => manager,
            None => {
                info!("Timeout sweeper ending: job manager deallocated");
                break;
            },
        };

        // Failures are isolated to the tick
        if let Err(err) = manager.sweep_timeouts().await {
            error!("{}", err.trace());
        }
        if let Err(err) = manager.sweep_ack_deadlines().await {
            error!("{}", err.trace());
        }
    }
}

/// Can be run as a `tokio` background task to fault nodes that went silent.
///
/// # Arguments
/// - `registry`/`manager`/`hub`: Weak handles; the task ends when any is dropped.
/// - `threshold`: The maximum tolerated heartbeat age.
/// - `interval`: The pause between sweeps.
pub async fn heartbeat_cycle(registry: Weak<NodeRegistry>, manager: Weak<JobManager>, hub: Weak<ConnectionHub>, threshold: Duration, interval: Duration) {
    debug!("Starting heartbeat sweeper ({interval:?}, threshold {threshold:?})");
    loop {
        tokio::time::sleep(interval).await;
        let (registry, manager, hub) = match (registry.upgrade(), manager.upgrade(), hub.upgrade()) {
            (Some(registry), Some(manager), Some(hub)) => (registry, manager, hub),
            _ => {
                info!("Heartbeat sweeper ending: host components deallocated");
                break;
            },
        };

        for agent_id in registry.sweep_heartbeats(threshold) {
            // Channel teardown moves the faulted node on to Disconnected
            hub.close(&agent_id);
            if let Err(err) = registry.apply_trigger(&agent_id, AgentTrigger::Disconnect) {
                debug!("Skipping Disconnect of faulted agent '{agent_id}': {err}");
            }
            if let Err(err) = manager.handle_agent_disconnect(&agent_id).await {
                error!("{}", err.trace());
            }
        }
    }
}

/// Consumes the hub's session lifecycle events: when a node's stream drops, its registry
/// record is disconnected and the jobs it held are requeued or dead-lettered.
///
/// # Arguments
/// - `events`: The hub's event receiver; the task ends when the hub is dropped.
/// - `registry`: The node registry.
/// - `manager`: The job manager.
pub async fn hub_cleanup(mut events: mpsc::UnboundedReceiver<HubEvent>, registry: Arc<NodeRegistry>, manager: Arc<JobManager>) {
    while let Some(event) = events.recv().await {
        match event {
            HubEvent::Attached { agent_id, connection_id } => {
                debug!("Session '{connection_id}' of agent '{agent_id}' attached");
            },
            HubEvent::Detached { agent_id, .. } => {
                info!("Session of agent '{agent_id}' dropped; cleaning up");
                if let Err(err) = registry.mark_disconnected(&agent_id) {
                    debug!("Skipping disconnect of agent '{agent_id}': {err}");
                }
                if let Err(err) = manager.handle_agent_disconnect(&agent_id).await {
                    error!("{}", err.trace());
                }
            },
        }
    }
    debug!("Hub cleanup task ending: hub deallocated");
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use orbitmesh_reg::enroll::EnrollmentService;
    use orbitmesh_tsk::manager::JobManagerConfig;
    use orbitmesh_tsk::repository::MemJobRepository;
    use orbitmesh_tsk::router::RoutePolicy;
    use specifications::jobs::{JobRequest, JobResult};
    use specifications::reporting::{
        AcknowledgeRequest, AgentDescriptor, AttachRequest, CapabilityInfo, RegisterRequest, ReportingService as _, ResultReport,
    };
    use tokio_stream::StreamExt as _;
    use tonic::Request;

    use crate::handler::ReportingHandler;
    use crate::hub::CommandStream;
    use crate::state::HostState;

    use super::*;

    /// Everything a host-side test needs.
    struct Harness {
        registry: Arc<NodeRegistry>,
        manager: Arc<JobManager>,
        router: Arc<Router>,
        hub: Arc<ConnectionHub>,
        handler: ReportingHandler,
        bootstrap_secret: String,
    }

    /// Builds the full host-side stack over in-memory stores.
    fn harness() -> Harness {
        let registry: Arc<NodeRegistry> = Arc::new(NodeRegistry::new());
        let manager: Arc<JobManager> = Arc::new(JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig::default()));
        let router: Arc<Router> = Arc::new(Router::new(registry.clone(), RoutePolicy::RoundRobin));
        let (hub, events) = ConnectionHub::new(registry.clone());
        tokio::spawn(hub_cleanup(events, registry.clone(), manager.clone()));

        let (enroll, bootstrap_secret) = EnrollmentService::new();
        enroll.set_auto_approve(true);
        let handler: ReportingHandler = ReportingHandler::new(
            registry.clone(),
            manager.clone(),
            hub.clone(),
            Arc::new(enroll),
            Arc::new(HostState::new()),
            Duration::from_secs(30),
        );
        Harness { registry, manager, router, hub, handler, bootstrap_secret }
    }

    /// Registers and attaches a node through the handler, returning its command stream.
    async fn connect_node(harness: &Harness, agent_id: &str, capabilities: &[&str]) -> CommandStream {
        let descriptor: AgentDescriptor = AgentDescriptor {
            id: agent_id.into(),
            name: format!("node-{agent_id}"),
            capabilities: capabilities.iter().map(|cap| CapabilityInfo { name: (*cap).into(), version: None, attributes: Default::default() }).collect(),
            group: None,
            tags: Vec::new(),
            metadata: Default::default(),
        };
        let reply = harness
            .handler
            .register(Request::new(RegisterRequest {
                agent: descriptor,
                bootstrap_token: Some(harness.bootstrap_secret.clone()),
                access_token: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(reply.success, "registration failed: {:?}", reply.error);
        assert_eq!(reply.recommended_heartbeat_interval_ms, 30_000);

        harness.handler.attach(Request::new(AttachRequest { agent_id: agent_id.into() })).await.unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_full_dispatch_round_trip() {
        let harness: Harness = harness();
        let mut stream: CommandStream = connect_node(&harness, "a1", &["shell"]).await;

        // Submit and dispatch
        let mut request: JobRequest = JobRequest::new("echo");
        request.required_capabilities = HashSet::from(["shell".to_string()]);
        request.parameters = b"hi".to_vec();
        let job: Job = harness.manager.enqueue(request).await.unwrap();
        assert_eq!(dispatch_once(&harness.manager, &harness.router, &harness.registry, &harness.hub).await, 1);

        // The node receives the command
        let command: Command = stream.next().await.unwrap().unwrap();
        let execute: ExecuteJob = match command.into_kind().unwrap() {
            CommandKind::Execute(execute) => execute,
            other => panic!("Expected ExecuteJob, got {other:?}"),
        };
        assert_eq!(execute.id, job.id());
        assert_eq!(execute.parameters, b"hi".to_vec());

        // ACK, then report the result through the handler
        harness.handler.acknowledge_job(Request::new(AcknowledgeRequest { job_id: execute.id.clone(), agent_id: "a1".into() })).await.unwrap();
        let result: JobResult = JobResult::completed(&execute.id, b"hi back".to_vec(), Duration::from_millis(3));
        harness.handler.report_result(Request::new(ResultReport::from_result(&result, "a1").unwrap())).await.unwrap();

        let done: Job = harness.manager.get(job.id()).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap().data, b"hi back".to_vec());
        // The duplicate report is accepted idempotently
        harness.handler.report_result(Request::new(ResultReport::from_result(&result, "a1").unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotent_submission_delivers_once() {
        let harness: Harness = harness();
        let mut stream: CommandStream = connect_node(&harness, "a1", &[]).await;

        let mut request: JobRequest = JobRequest::new("echo");
        request.idempotency_key = Some("k1".into());
        request.parameters = b"hi".to_vec();
        let first: Job = harness.manager.enqueue(request.clone()).await.unwrap();
        request.id = uuid::Uuid::new_v4().to_string();
        let second: Job = harness.manager.enqueue(request).await.unwrap();
        assert_eq!(first.id(), second.id());

        // Exactly one command goes out
        assert_eq!(dispatch_once(&harness.manager, &harness.router, &harness.registry, &harness.hub).await, 1);
        assert_eq!(dispatch_once(&harness.manager, &harness.router, &harness.registry, &harness.hub).await, 0);
        let command: Command = stream.next().await.unwrap().unwrap();
        assert!(matches!(command.into_kind().unwrap(), CommandKind::Execute(_)));
    }

    #[tokio::test]
    async fn test_no_matching_node_leaves_job_pending() {
        let harness: Harness = harness();
        let _stream: CommandStream = connect_node(&harness, "a1", &["shell"]).await;

        let mut request: JobRequest = JobRequest::new("train");
        request.required_capabilities = HashSet::from(["gpu".to_string()]);
        let job: Job = harness.manager.enqueue(request).await.unwrap();

        assert_eq!(dispatch_once(&harness.manager, &harness.router, &harness.registry, &harness.hub).await, 0);
        assert_eq!(harness.manager.get(job.id()).await.unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(harness.manager.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_stream_drop_requeues_idempotent_jobs() {
        let harness: Harness = harness();
        let mut stream: CommandStream = connect_node(&harness, "a1", &[]).await;

        let mut request: JobRequest = JobRequest::new("echo");
        request.idempotency_key = Some("k1".into());
        let job: Job = harness.manager.enqueue(request).await.unwrap();
        dispatch_once(&harness.manager, &harness.router, &harness.registry, &harness.hub).await;
        let _ = stream.next().await;

        // The node goes away mid-job
        drop(stream);
        for _ in 0..100 {
            if harness.manager.get(job.id()).await.unwrap().unwrap().status == JobStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let requeued: Job = harness.manager.get(job.id()).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert!(requeued.excluded_agent_ids.contains("a1"));
        assert_eq!(harness.registry.get("a1").unwrap().status, specifications::agents::AgentStatus::Disconnected);
    }
}
