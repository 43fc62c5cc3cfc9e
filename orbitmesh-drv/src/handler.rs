//  HANDLER.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the host's side of the node transport: the
//!   `ReportingService` that nodes register, heartbeat and report
//!   against, and whose `attach` call hands out the per-node command
//!   stream.
//

use std::sync::Arc;
use std::time::Duration;

use error_trace::ErrorTrace as _;
use log::{debug, error, info, warn};
use orbitmesh_reg::enroll::{EnrollmentDecision, EnrollmentService};
use orbitmesh_reg::registry::NodeRegistry;
use orbitmesh_tsk::errors::JobError;
use orbitmesh_tsk::manager::JobManager;
use specifications::agents::{AgentInfo, AgentStatus, AgentTrigger};
use specifications::jobs::{JobProgress, JobResult};
use specifications::reporting::{
    AcknowledgeRequest, AttachRequest, Empty, HeartbeatRequest, ProgressReport, RegisterReply, RegisterRequest, ReportingService, ResultReport,
    StateReport, StreamItemReport, UnregisterRequest,
};
use tonic::{Request, Response, Status};

use crate::hub::{CommandStream, ConnectionHub};
use crate::state::HostState;


/***** HELPER FUNCTIONS *****/
/// Maps a job manager error onto a gRPC status.
fn job_err_to_status(err: JobError) -> Status {
    match err {
        JobError::UnknownJob { id } => Status::not_found(format!("Unknown job '{id}'")),
        JobError::IllegalTransition { .. } => Status::failed_precondition(err.to_string()),
        JobError::Repository { .. } => {
            error!("{}", err.trace());
            Status::internal("An internal error has occurred")
        },
        JobError::UnknownDeadLetter { .. } => Status::not_found(err.to_string()),
    }
}





/***** LIBRARY *****/
/// The ReportingHandler handles everything nodes send to the host.
#[derive(Clone)]
pub struct ReportingHandler {
    /// The node registry.
    registry: Arc<NodeRegistry>,
    /// The job manager.
    manager: Arc<JobManager>,
    /// The connection hub.
    hub: Arc<ConnectionHub>,
    /// The enrollment flow (bootstrap token + approvals).
    enroll: Arc<EnrollmentService>,
    /// The persisted-state facade (access-token verification).
    state: Arc<HostState>,
    /// The heartbeat interval recommended to registering nodes.
    heartbeat_interval: Duration,
}

impl ReportingHandler {
    /// Constructor for the ReportingHandler.
    ///
    /// # Arguments
    /// - `registry`: The node registry.
    /// - `manager`: The job manager.
    /// - `hub`: The connection hub.
    /// - `enroll`: The enrollment service.
    /// - `state`: The persisted-state facade.
    /// - `heartbeat_interval`: The heartbeat interval recommended to nodes.
    ///
    /// # Returns
    /// A new ReportingHandler instance.
    pub fn new(
        registry: Arc<NodeRegistry>,
        manager: Arc<JobManager>,
        hub: Arc<ConnectionHub>,
        enroll: Arc<EnrollmentService>,
        state: Arc<HostState>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self { registry, manager, hub, enroll, state, heartbeat_interval }
    }

    /// Applies a node-reported state as a lifecycle trigger, where one maps.
    fn apply_reported_state(&self, agent_id: &str, reported: AgentStatus) {
        let current: AgentStatus = match self.registry.get(agent_id) {
            Some(agent) => agent.status,
            None => return,
        };
        let trigger: Option<AgentTrigger> = match reported {
            AgentStatus::Paused => Some(AgentTrigger::Pause),
            AgentStatus::Ready if current == AgentStatus::Paused => Some(AgentTrigger::Resume),
            AgentStatus::Stopping => Some(AgentTrigger::Stop),
            AgentStatus::Stopped => Some(AgentTrigger::Stopped),
            _ => None,
        };
        if let Some(trigger) = trigger {
            // Illegal reports are rejected without a state change
            if let Err(err) = self.registry.apply_trigger(agent_id, trigger) {
                debug!("Ignoring reported state '{reported}' of agent '{agent_id}': {err}");
            }
        }
    }
}

#[tonic::async_trait]
impl ReportingService for ReportingHandler {
    type AttachStream = CommandStream;

    /// Registers a node, subject to access-token or bootstrap-token authentication.
    ///
    /// # Returns
    /// A [`RegisterReply`] with the recommended heartbeat interval, or `success = false` with
    /// a reason when the node must wait for (or was denied) approval.
    ///
    /// # Errors
    /// This function does not typically error; denials travel inside the reply.
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<RegisterReply>, Status> {
        let RegisterRequest { agent, bootstrap_token, access_token } = request.into_inner();
        let info: AgentInfo = agent.into();
        debug!("Registration request from '{}' ({})", info.id, info.name);

        // A valid pre-issued access token short-circuits enrollment
        let decision: EnrollmentDecision = if access_token.map(|token| self.state.tokens.verify(&token)).unwrap_or(false) {
            EnrollmentDecision::Approved
        } else {
            self.enroll.handle_registration(&info.id, &info.name, info.capabilities.keys().cloned().collect(), bootstrap_token.as_deref())
        };

        match decision {
            EnrollmentDecision::Approved => {
                let connection_id: String = uuid::Uuid::new_v4().to_string();
                self.registry.register(info, connection_id);
                Ok(Response::new(RegisterReply {
                    success: true,
                    recommended_heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
                    error: None,
                }))
            },
            EnrollmentDecision::Pending { enrollment_id } => {
                info!("Node '{}' parked in enrollment '{}' pending approval", info.id, enrollment_id);
                Ok(Response::new(RegisterReply {
                    success: false,
                    recommended_heartbeat_interval_ms: 0,
                    error: Some(format!("enrollment pending approval ({enrollment_id})")),
                }))
            },
            EnrollmentDecision::Denied { reason } => {
                warn!("Registration of node '{}' denied: {reason}", info.id);
                Ok(Response::new(RegisterReply { success: false, recommended_heartbeat_interval_ms: 0, error: Some(reason) }))
            },
        }
    }

    /// Unregisters a node: its session is torn down and the jobs it held are requeued or
    /// dead-lettered per the idempotency policy.
    async fn unregister(&self, request: Request<UnregisterRequest>) -> Result<Response<Empty>, Status> {
        let UnregisterRequest { agent_id } = request.into_inner();
        info!("Agent '{agent_id}' unregistering");

        self.hub.close(&agent_id);
        if let Err(err) = self.registry.mark_disconnected(&agent_id) {
            debug!("Unregister of unknown/disconnected agent '{agent_id}': {err}");
        }
        if let Err(err) = self.manager.handle_agent_disconnect(&agent_id).await {
            error!("{}", err.trace());
        }
        Ok(Response::new(Empty {}))
    }

    /// Records a heartbeat.
    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<Empty>, Status> {
        let HeartbeatRequest { agent_id } = request.into_inner();
        match self.registry.heartbeat(&agent_id) {
            Ok(_) => Ok(Response::new(Empty {})),
            Err(err) => Err(Status::not_found(err.to_string())),
        }
    }

    /// Records a job acknowledgement.
    async fn acknowledge_job(&self, request: Request<AcknowledgeRequest>) -> Result<Response<Empty>, Status> {
        let AcknowledgeRequest { job_id, agent_id } = request.into_inner();
        debug!("Agent '{agent_id}' acknowledged job '{job_id}'");
        self.manager.acknowledge(&job_id, &agent_id).await.map_err(job_err_to_status)?;
        Ok(Response::new(Empty {}))
    }

    /// Ingests a terminal job result. Duplicate reports are accepted idempotently.
    async fn report_result(&self, request: Request<ResultReport>) -> Result<Response<Empty>, Status> {
        let report: ResultReport = request.into_inner();
        let agent_id: String = report.agent_id.clone();
        let result: JobResult = JobResult::try_from(report).map_err(|err| Status::invalid_argument(err.to_string()))?;
        debug!("Agent '{agent_id}' reported result for job '{}': {}", result.job_id, result.status);

        self.manager.ingest_result(result).await.map_err(job_err_to_status)?;

        // The node goes back to Ready once nothing of ours runs on it anymore
        if self.manager.active_count(&agent_id) == 0 {
            if let Err(err) = self.registry.apply_trigger(&agent_id, AgentTrigger::CompleteJob) {
                debug!("Skipping CompleteJob trigger for agent '{agent_id}': {err}");
            }
        }
        Ok(Response::new(Empty {}))
    }

    /// Ingests a progress report (clamped, fanned out, first report moves the job to
    /// Running).
    async fn report_progress(&self, request: Request<ProgressReport>) -> Result<Response<Empty>, Status> {
        let progress: JobProgress = request.into_inner().into();
        self.manager.update_progress(progress).await.map_err(job_err_to_status)?;
        Ok(Response::new(Empty {}))
    }

    /// Ingests a node's self-reported lifecycle state.
    async fn report_state(&self, request: Request<StateReport>) -> Result<Response<Empty>, Status> {
        let report: StateReport = request.into_inner();
        let reported: AgentStatus = report.parse_state().map_err(|err| Status::invalid_argument(err.to_string()))?;
        self.apply_reported_state(&report.agent_id, reported);
        Ok(Response::new(Empty {}))
    }

    /// Ingests one item of a streaming job's output; forwarded to progress subscribers as a
    /// message-bearing report.
    async fn report_stream_item(&self, request: Request<StreamItemReport>) -> Result<Response<Empty>, Status> {
        let item: StreamItemReport = request.into_inner();
        debug!("Stream item {} for job '{}' ({} bytes, final: {})", item.sequence, item.job_id, item.data.len(), item.is_final);

        // Stream items ride the progress channel so subscribers see them in order
        let message: String = String::from_utf8_lossy(&item.data).into_owned();
        let progress: JobProgress = JobProgress::new(&item.job_id, if item.is_final { 100 } else { -1 }, message);
        self.manager.update_progress(progress).await.map_err(job_err_to_status)?;
        Ok(Response::new(Empty {}))
    }

    /// Hands out the node's command stream. The node must have registered on this session
    /// first.
    async fn attach(&self, request: Request<AttachRequest>) -> Result<Response<Self::AttachStream>, Status> {
        let AttachRequest { agent_id } = request.into_inner();
        let agent: AgentInfo = match self.registry.get(&agent_id) {
            Some(agent) => agent,
            None => return Err(Status::failed_precondition(format!("Agent '{agent_id}' is not registered"))),
        };
        let connection_id: String = match agent.connection_id {
            Some(connection_id) => connection_id,
            None => return Err(Status::failed_precondition(format!("Agent '{agent_id}' has no live registration"))),
        };

        info!("Agent '{agent_id}' attached (session '{connection_id}')");
        Ok(Response::new(self.hub.attach(agent_id, connection_id)))
    }
}
