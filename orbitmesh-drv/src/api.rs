//  API.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the host's HTTP/JSON admin API and the SSE dashboard
//!   feed. All admin endpoints sit behind the `X-Admin-Password` header
//!   (or a valid API token); webhooks authenticate with their own shared
//!   secret. Errors are rendered as `{"error": ..., "code": ...}` with
//!   the matching status code.
//

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt as _;
use log::{debug, error};
use orbitmesh_exe::engine::WorkflowEngine;
use orbitmesh_exe::errors::{EngineError, TriggerError, WorkflowRepoError};
use orbitmesh_exe::instance::WorkflowInstance;
use orbitmesh_exe::triggers::TriggerService;
use orbitmesh_exe::workflow::WorkflowDefinition;
use orbitmesh_reg::enroll::{EnrollmentService, EnrollmentStatus};
use orbitmesh_reg::registry::NodeRegistry;
use orbitmesh_tsk::errors::JobError;
use orbitmesh_tsk::manager::JobManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specifications::commanding::{CancelJob, Command, CommandKind};
use specifications::jobs::{Job, JobPattern, JobRequest, JobStatus};
use tokio_stream::wrappers::BroadcastStream;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::deploy::{DeploymentEngine, DeploymentProfile};
use crate::errors::DeployError;
use crate::events::EventBus;
use crate::hub::ConnectionHub;
use crate::state::HostState;


/***** CONSTANTS *****/
/// The admin password header.
pub const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";
/// The API token header (an alternative to the password).
pub const API_TOKEN_HEADER: &str = "x-api-token";





/***** ERRORS *****/
/// The rejection every handler speaks: a status code plus the JSON error body.
#[derive(Debug)]
pub struct ApiError {
    /// The HTTP status to answer with.
    pub status: StatusCode,
    /// The human-readable error.
    pub error: String,
    /// The machine-readable code, if any.
    pub code: Option<String>,
}
impl warp::reject::Reject for ApiError {}
impl ApiError {
    /// Builds a rejection with the given status and message.
    fn new(status: StatusCode, error: impl Into<String>, code: Option<&str>) -> Rejection {
        warp::reject::custom(Self { status, error: error.into(), code: code.map(String::from) })
    }

    /// A 400 with code `validation`.
    fn validation(error: impl Into<String>) -> Rejection { Self::new(StatusCode::BAD_REQUEST, error, Some("validation")) }

    /// A 404 with code `not_found`.
    fn not_found(error: impl Into<String>) -> Rejection { Self::new(StatusCode::NOT_FOUND, error, Some("not_found")) }

    /// A 401 with code `unauthorized`.
    fn unauthorized() -> Rejection { Self::new(StatusCode::UNAUTHORIZED, "Missing or invalid admin credentials", Some("unauthorized")) }
}

/// Maps job manager errors onto rejections.
fn job_err(err: JobError) -> Rejection {
    match &err {
        JobError::UnknownJob { .. } | JobError::UnknownDeadLetter { .. } => ApiError::not_found(err.to_string()),
        JobError::IllegalTransition { .. } => ApiError::new(StatusCode::CONFLICT, err.to_string(), Some("conflict")),
        JobError::Repository { .. } => {
            error!("Job repository failure behind the API: {err}");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "An internal error has occurred", None)
        },
    }
}

/// Maps workflow repository errors onto rejections.
fn wf_repo_err(err: WorkflowRepoError) -> Rejection {
    match &err {
        WorkflowRepoError::UnknownWorkflow { .. } | WorkflowRepoError::UnknownInstance { .. } => ApiError::not_found(err.to_string()),
        WorkflowRepoError::VersionConflict { .. } => ApiError::new(StatusCode::CONFLICT, err.to_string(), Some("conflict")),
        WorkflowRepoError::Storage { .. } => {
            error!("Workflow store failure behind the API: {err}");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "An internal error has occurred", None)
        },
    }
}

/// Maps engine errors onto rejections.
fn engine_err(err: EngineError) -> Rejection {
    match err {
        EngineError::Definition { err } => ApiError::validation(err.to_string()),
        EngineError::Repository { err } => wf_repo_err(err),
        EngineError::InstanceNotLive { .. } => ApiError::new(StatusCode::CONFLICT, err_string(&err), Some("conflict")),
        EngineError::WorkflowInactive { .. } => ApiError::validation(err_string(&err)),
    }
}

/// Renders an error through its Display (helper for moves above).
fn err_string(err: &dyn std::error::Error) -> String { err.to_string() }

/// Maps trigger errors onto rejections.
fn trigger_err(err: TriggerError) -> Rejection {
    match err {
        TriggerError::BadWebhookSecret { .. } => ApiError::unauthorized(),
        TriggerError::MethodNotAllowed { .. } => ApiError::new(StatusCode::METHOD_NOT_ALLOWED, err_string(&err), Some("method_not_allowed")),
        TriggerError::InputValidation { .. } | TriggerError::NoManualTrigger { .. } => ApiError::validation(err_string(&err)),
        TriggerError::Engine { err } => engine_err(err),
        TriggerError::Repository { err } => wf_repo_err(err),
    }
}

/// Maps deployment errors onto rejections.
fn deploy_err(err: DeployError) -> Rejection {
    match &err {
        DeployError::UnknownProfile { .. } | DeployError::UnknownExecution { .. } => ApiError::not_found(err.to_string()),
        DeployError::FeatureDisabled | DeployError::OutsideRoot { .. } => ApiError::validation(err.to_string()),
        DeployError::ScanError { .. } => {
            error!("Deployment scan failure behind the API: {err}");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "An internal error has occurred", None)
        },
    }
}





/***** BODIES *****/
/// The JSON body of a job submission.
#[derive(Debug, Deserialize)]
pub struct SubmitJob {
    /// The command to execute.
    pub command: String,
    /// The execution pattern (request/response when omitted).
    #[serde(default)]
    pub pattern: Option<JobPattern>,
    /// JSON parameters, serialized into the job's opaque payload.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Collapses duplicate submissions.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: i32,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Retry budget.
    #[serde(default)]
    pub max_retries: u32,
    /// Pin to a specific node.
    #[serde(default)]
    pub target_agent_id: Option<String>,
    /// Required capabilities.
    #[serde(default)]
    pub required_capabilities: HashSet<String>,
    /// Required tags.
    #[serde(default)]
    pub required_tags: HashSet<String>,
    /// Correlation id.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The JSON body of a workflow start.
#[derive(Debug, Default, Deserialize)]
pub struct StartWorkflow {
    /// The instance input.
    #[serde(default)]
    pub input: Value,
    /// The specific version to start (latest when omitted).
    #[serde(default)]
    pub version: Option<String>,
    /// Correlates the instance with external flows.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// The JSON body of a token creation.
#[derive(Debug, Deserialize)]
pub struct CreateToken {
    /// The token's label.
    pub name: String,
}

/// The JSON body of a bootstrap-token update.
#[derive(Debug, Deserialize)]
pub struct UpdateBootstrapToken {
    /// Enable or disable the token.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Toggle auto-approval.
    #[serde(default)]
    pub auto_approve: Option<bool>,
}

/// The JSON body of an externally published event.
#[derive(Debug, Deserialize)]
pub struct PublishEvent {
    /// The event type.
    pub event_type: String,
    /// The event payload.
    #[serde(default)]
    pub data: Value,
}

/// The host status document.
#[derive(Debug, Serialize)]
struct StatusDoc {
    name: &'static str,
    version: &'static str,
    started_at: DateTime<Utc>,
    agents_total: usize,
    agents_eligible: usize,
    jobs_queued: usize,
    dead_letters: usize,
    schema_version: u32,
}





/***** CONTEXT *****/
/// Everything the handlers need, cloned into each route.
#[derive(Clone)]
pub struct ApiContext {
    /// The node registry.
    pub registry: Arc<NodeRegistry>,
    /// The job manager.
    pub manager: Arc<JobManager>,
    /// The workflow engine.
    pub engine: Arc<WorkflowEngine>,
    /// The trigger service.
    pub triggers: Arc<TriggerService>,
    /// The enrollment service.
    pub enroll: Arc<EnrollmentService>,
    /// The connection hub (for cancel fan-out).
    pub hub: Arc<ConnectionHub>,
    /// The persisted-state facade.
    pub state: Arc<HostState>,
    /// The deployment engine.
    pub deploy: Arc<DeploymentEngine>,
    /// The dashboard bus.
    pub bus: Arc<EventBus>,
    /// The admin password, if the API is protected.
    pub admin_password: Option<String>,
    /// When the host came up.
    pub started_at: DateTime<Utc>,
}





/***** HANDLERS *****/
/// GET /api/status
async fn get_status(ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let agents = ctx.registry.list();
    let doc: StatusDoc = StatusDoc {
        name: "orbitmesh",
        version: env!("CARGO_PKG_VERSION"),
        started_at: ctx.started_at,
        agents_total: agents.len(),
        agents_eligible: agents.iter().filter(|agent| agent.status.is_eligible()).count(),
        jobs_queued: ctx.manager.queue_len(),
        dead_letters: ctx.manager.deadletter().len(),
        schema_version: ctx.state.schema_version().version,
    };
    Ok(warp::reply::json(&doc))
}

/// GET /api/agents
async fn list_agents(ctx: ApiContext) -> Result<impl Reply, Rejection> { Ok(warp::reply::json(&ctx.registry.list())) }

/// GET /api/agents/{id}
async fn get_agent(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    match ctx.registry.get(&id) {
        Some(agent) => Ok(warp::reply::json(&agent)),
        None => Err(ApiError::not_found(format!("Unknown agent '{id}'"))),
    }
}

/// GET /api/jobs?status=
async fn list_jobs(query: HashMap<String, String>, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let jobs: Vec<Job> = match query.get("status") {
        Some(raw) => {
            let status: JobStatus = raw.parse().map_err(|_| ApiError::validation(format!("Unknown job status '{raw}'")))?;
            ctx.manager.get_by_status(status).await.map_err(job_err)?
        },
        None => ctx.manager.list().await.map_err(job_err)?,
    };
    Ok(warp::reply::json(&jobs))
}

/// POST /api/jobs
async fn submit_job(body: SubmitJob, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    if body.command.is_empty() {
        return Err(ApiError::validation("A job needs a non-empty command"));
    }

    let mut request: JobRequest = JobRequest::new(body.command);
    request.pattern = body.pattern.unwrap_or(JobPattern::RequestResponse);
    if let Some(parameters) = body.parameters {
        request.parameters = serde_json::to_vec(&parameters).unwrap_or_default();
    }
    request.idempotency_key = body.idempotency_key;
    request.priority = body.priority;
    request.timeout = body.timeout_secs.map(Duration::from_secs);
    request.max_retries = body.max_retries;
    request.target_agent_id = body.target_agent_id;
    request.required_capabilities = body.required_capabilities;
    request.required_tags = body.required_tags;
    request.correlation_id = body.correlation_id;
    request.metadata = body.metadata;

    let job: Job = ctx.manager.enqueue(request).await.map_err(job_err)?;
    Ok(warp::reply::with_status(warp::reply::json(&job), StatusCode::CREATED))
}

/// GET /api/jobs/{id}
async fn get_job(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    match ctx.manager.get(&id).await.map_err(job_err)? {
        Some(job) => Ok(warp::reply::json(&job)),
        None => Err(ApiError::not_found(format!("Unknown job '{id}'"))),
    }
}

/// POST /api/jobs/{id}/cancel
async fn cancel_job(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let holder: Option<String> = ctx.manager.cancel(&id, Some("cancelled via api".into())).await.map_err(job_err)?;
    if let Some(agent_id) = holder {
        // Best effort: the node may already be gone
        let command: Command = Command::new(CommandKind::Cancel(CancelJob { job_id: id.clone(), reason: Some("cancelled via api".into()) }));
        if let Err(err) = ctx.hub.send_to_agent(&agent_id, command) {
            debug!("Could not forward cancel of job '{id}' to agent '{agent_id}': {err}");
        }
    }
    Ok(warp::reply::with_status(warp::reply::reply(), StatusCode::NO_CONTENT))
}

/// GET /api/workflows
async fn list_workflows(ctx: ApiContext) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&ctx.engine.definitions().list().await.map_err(wf_repo_err)?))
}

/// POST /api/workflows
async fn store_workflow(definition: WorkflowDefinition, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    definition.validate().map_err(|err| ApiError::validation(err.to_string()))?;
    ctx.engine.definitions().store(definition.clone()).await.map_err(wf_repo_err)?;
    if definition.is_active {
        ctx.triggers.activate_workflow(&definition);
    }
    Ok(warp::reply::with_status(warp::reply::json(&definition), StatusCode::CREATED))
}

/// GET /api/workflows/{id}
async fn get_workflow(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&ctx.engine.definitions().get(&id, None).await.map_err(wf_repo_err)?))
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    ctx.triggers.deactivate_workflow(&id);
    ctx.engine.definitions().remove(&id).await.map_err(wf_repo_err)?;
    Ok(warp::reply::with_status(warp::reply::reply(), StatusCode::NO_CONTENT))
}

/// POST /api/workflows/{id}/start
async fn start_workflow(id: String, body: StartWorkflow, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let instance: WorkflowInstance =
        ctx.engine.start(&id, body.version.as_deref(), body.input, None, body.correlation_id).await.map_err(engine_err)?;
    Ok(warp::reply::with_status(warp::reply::json(&instance), StatusCode::CREATED))
}

/// GET /api/workflows/instances?workflowId=
async fn list_instances(query: HashMap<String, String>, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let workflow_id: Option<&str> = query.get("workflowId").map(String::as_str);
    Ok(warp::reply::json(&ctx.engine.instances().list(workflow_id).await.map_err(wf_repo_err)?))
}

/// GET /api/workflows/instances/{id}
async fn get_instance(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    match ctx.engine.instances().get(&id).await.map_err(wf_repo_err)? {
        Some(instance) => Ok(warp::reply::json(&instance)),
        None => Err(ApiError::not_found(format!("Unknown workflow instance '{id}'"))),
    }
}

/// POST /api/workflows/instances/{id}/cancel
async fn cancel_instance(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    ctx.engine.cancel(&id, Some("cancelled via api".into())).await.map_err(engine_err)?;
    Ok(warp::reply::with_status(warp::reply::reply(), StatusCode::NO_CONTENT))
}

/// POST /api/triggers/event
async fn publish_event(body: PublishEvent, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let started: Vec<String> = ctx.triggers.process_event(&body.event_type, body.data).await;
    Ok(warp::reply::json(&serde_json::json!({ "started": started })))
}

/// POST|PUT /api/webhooks/{tail}
async fn webhook(tail: warp::path::Tail, method: &'static str, headers: warp::http::HeaderMap, body: Value, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let path: String = format!("/{}", tail.as_str());
    let headers: HashMap<String, String> = headers
        .iter()
        .map(|(name, value)| (name.as_str().to_lowercase(), value.to_str().unwrap_or_default().to_string()))
        .collect();
    let started: Vec<String> = ctx.triggers.process_webhook(&path, method, body, &headers).await.map_err(trigger_err)?;
    Ok(warp::reply::json(&serde_json::json!({ "started": started })))
}

/// GET /api/tokens
async fn list_tokens(ctx: ApiContext) -> Result<impl Reply, Rejection> { Ok(warp::reply::json(&ctx.state.tokens.list())) }

/// POST /api/tokens
async fn create_token(body: CreateToken, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let (token, secret) = ctx.state.tokens.create(body.name);
    // The secret is visible in this reply only
    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "id": token.id, "name": token.name, "secret": secret })),
        StatusCode::CREATED,
    ))
}

/// DELETE /api/tokens/{id}
async fn revoke_token(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    if !ctx.state.tokens.revoke(&id) {
        return Err(ApiError::not_found(format!("Unknown token '{id}'")));
    }
    Ok(warp::reply::with_status(warp::reply::reply(), StatusCode::NO_CONTENT))
}

/// GET /api/enrollment/bootstrap-token
async fn get_bootstrap_token(ctx: ApiContext) -> Result<impl Reply, Rejection> { Ok(warp::reply::json(&ctx.enroll.token())) }

/// POST /api/enrollment/bootstrap-token/regenerate
async fn regenerate_bootstrap_token(ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let secret: String = ctx.enroll.regenerate_token();
    Ok(warp::reply::json(&serde_json::json!({ "secret": secret })))
}

/// PUT /api/enrollment/bootstrap-token
async fn update_bootstrap_token(body: UpdateBootstrapToken, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    if let Some(enabled) = body.enabled {
        ctx.enroll.set_token_enabled(enabled);
    }
    if let Some(auto_approve) = body.auto_approve {
        ctx.enroll.set_auto_approve(auto_approve);
    }
    Ok(warp::reply::with_status(warp::reply::reply(), StatusCode::NO_CONTENT))
}

/// GET /api/enrollment/requests
async fn list_enrollments(ctx: ApiContext) -> Result<impl Reply, Rejection> { Ok(warp::reply::json(&ctx.enroll.list())) }

/// POST /api/enrollment/requests/{id}/{decision}
async fn decide_enrollment(id: String, decision: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let status: EnrollmentStatus = match decision.as_str() {
        "approve" => EnrollmentStatus::Approved,
        "reject" => EnrollmentStatus::Rejected,
        "block" => EnrollmentStatus::Blocked,
        other => return Err(ApiError::validation(format!("Unknown decision '{other}'"))),
    };
    ctx.enroll.decide(&id, status).map_err(|err| ApiError::not_found(err.to_string()))?;
    Ok(warp::reply::with_status(warp::reply::reply(), StatusCode::NO_CONTENT))
}

/// GET /api/deployment/profiles
async fn list_profiles(ctx: ApiContext) -> Result<impl Reply, Rejection> { Ok(warp::reply::json(&ctx.deploy.list_profiles())) }

/// POST /api/deployment/profiles
async fn store_profile(profile: DeploymentProfile, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    ctx.deploy.store_profile(profile.clone()).map_err(deploy_err)?;
    Ok(warp::reply::with_status(warp::reply::json(&profile), StatusCode::CREATED))
}

/// DELETE /api/deployment/profiles/{id}
async fn delete_profile(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    ctx.deploy.remove_profile(&id).map_err(deploy_err)?;
    Ok(warp::reply::with_status(warp::reply::reply(), StatusCode::NO_CONTENT))
}

/// POST /api/deployment/profiles/{id}/deploy
async fn deploy_profile(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let executions: Vec<String> = ctx.deploy.deploy(&id).map_err(deploy_err)?;
    Ok(warp::reply::json(&serde_json::json!({ "executions": executions })))
}

/// GET /api/deployment/profiles/{id}/agents
async fn profile_agents(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&ctx.deploy.matching_agents(&id).map_err(deploy_err)?))
}

/// GET /api/deployment/executions?offset=&limit=
async fn list_executions(query: HashMap<String, String>, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let offset: usize = query.get("offset").and_then(|raw| raw.parse().ok()).unwrap_or(0);
    let limit: usize = query.get("limit").and_then(|raw| raw.parse().ok()).unwrap_or(50);
    Ok(warp::reply::json(&ctx.deploy.list_executions(offset, limit)))
}

/// POST /api/deployment/executions/{id}/cancel
async fn cancel_execution(id: String, ctx: ApiContext) -> Result<impl Reply, Rejection> {
    ctx.deploy.cancel_execution(&id).await.map_err(deploy_err)?;
    Ok(warp::reply::with_status(warp::reply::reply(), StatusCode::NO_CONTENT))
}

/// GET /api/deployment/status
async fn deployment_status(ctx: ApiContext) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "enabled": ctx.deploy.is_enabled(),
        "profiles": ctx.deploy.list_profiles().len(),
        "executions": ctx.deploy.status_summary(),
    })))
}

/// GET /api/events (SSE dashboard feed)
async fn events_stream(ctx: ApiContext) -> Result<impl Reply, Rejection> {
    let stream = BroadcastStream::new(ctx.bus.subscribe()).filter_map(|event| async move {
        match event {
            Ok(event) => {
                let data: String = serde_json::to_string(&event).unwrap_or_default();
                Some(Ok::<_, Infallible>(warp::sse::Event::default().data(data)))
            },
            // Lagged dashboards just miss events
            Err(_) => None,
        }
    });
    Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}





/***** LIBRARY *****/
/// Renders rejections as the `{"error", "code"}` JSON shape.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, error, code): (StatusCode, String, Option<String>) = if let Some(api) = err.find::<ApiError>() {
        (api.status, api.error.clone(), api.code.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "No such endpoint".into(), Some("not_found".into()))
    } else if let Some(body) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, body.to_string(), Some("validation".into()))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".into(), Some("method_not_allowed".into()))
    } else {
        error!("Unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "An internal error has occurred".into(), None)
    };

    let body = warp::reply::json(&serde_json::json!({ "error": error, "code": code }));
    Ok(warp::reply::with_status(body, status))
}

/// Builds the full route tree.
///
/// # Arguments
/// - `ctx`: The shared handler context.
///
/// # Returns
/// A warp filter ready to serve.
pub fn routes(ctx: ApiContext) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let with_ctx = {
        let ctx: ApiContext = ctx.clone();
        warp::any().map(move || ctx.clone())
    };

    // The admin guard: the password header, or a valid API token
    let guarded = {
        let ctx: ApiContext = ctx.clone();
        warp::header::optional::<String>(ADMIN_PASSWORD_HEADER).and(warp::header::optional::<String>(API_TOKEN_HEADER)).and_then(
            move |password: Option<String>, token: Option<String>| {
                let ctx: ApiContext = ctx.clone();
                async move {
                    let authorized: bool = match &ctx.admin_password {
                        // An unprotected host accepts everything
                        None => true,
                        Some(expected) => {
                            password.as_deref() == Some(expected.as_str()) || token.map(|token| ctx.state.tokens.verify(&token)).unwrap_or(false)
                        },
                    };
                    if authorized { Ok(()) } else { Err(ApiError::unauthorized()) }
                }
            },
        )
        .untuple_one()
    };

    // Public surface: status, and webhooks (they carry their own secret)
    let status = warp::path!("api" / "status").and(warp::get()).and(with_ctx.clone()).and_then(get_status);
    // Webhook callers speak POST or PUT; the method still gets validated per trigger
    let webhook_method = warp::post().map(|| "POST").or(warp::put().map(|| "PUT")).unify();
    let webhooks = warp::path("api")
        .and(warp::path("webhooks"))
        .and(warp::path::tail())
        .and(webhook_method)
        .and(warp::header::headers_cloned())
        .and(warp::body::json())
        .and(with_ctx.clone())
        .and_then(webhook);

    // Agents
    let agents = warp::path!("api" / "agents").and(warp::get()).and(with_ctx.clone()).and_then(list_agents);
    let agent = warp::path!("api" / "agents" / String).and(warp::get()).and(with_ctx.clone()).and_then(get_agent);

    // Jobs
    let jobs_list = warp::path!("api" / "jobs").and(warp::get()).and(warp::query()).and(with_ctx.clone()).and_then(list_jobs);
    let jobs_submit = warp::path!("api" / "jobs").and(warp::post()).and(warp::body::json()).and(with_ctx.clone()).and_then(submit_job);
    let jobs_get = warp::path!("api" / "jobs" / String).and(warp::get()).and(with_ctx.clone()).and_then(get_job);
    let jobs_cancel = warp::path!("api" / "jobs" / String / "cancel").and(warp::post()).and(with_ctx.clone()).and_then(cancel_job);

    // Workflows (instances first, so `instances` is not parsed as a workflow id)
    let instances_list =
        warp::path!("api" / "workflows" / "instances").and(warp::get()).and(warp::query()).and(with_ctx.clone()).and_then(list_instances);
    let instances_get = warp::path!("api" / "workflows" / "instances" / String).and(warp::get()).and(with_ctx.clone()).and_then(get_instance);
    let instances_cancel =
        warp::path!("api" / "workflows" / "instances" / String / "cancel").and(warp::post()).and(with_ctx.clone()).and_then(cancel_instance);
    let workflows_list = warp::path!("api" / "workflows").and(warp::get()).and(with_ctx.clone()).and_then(list_workflows);
    let workflows_store = warp::path!("api" / "workflows").and(warp::post()).and(warp::body::json()).and(with_ctx.clone()).and_then(store_workflow);
    let workflows_get = warp::path!("api" / "workflows" / String).and(warp::get()).and(with_ctx.clone()).and_then(get_workflow);
    let workflows_delete = warp::path!("api" / "workflows" / String).and(warp::delete()).and(with_ctx.clone()).and_then(delete_workflow);
    let workflows_start =
        warp::path!("api" / "workflows" / String / "start").and(warp::post()).and(warp::body::json()).and(with_ctx.clone()).and_then(start_workflow);

    // Triggers
    let publish = warp::path!("api" / "triggers" / "event").and(warp::post()).and(warp::body::json()).and(with_ctx.clone()).and_then(publish_event);

    // Tokens
    let tokens_list = warp::path!("api" / "tokens").and(warp::get()).and(with_ctx.clone()).and_then(list_tokens);
    let tokens_create = warp::path!("api" / "tokens").and(warp::post()).and(warp::body::json()).and(with_ctx.clone()).and_then(create_token);
    let tokens_revoke = warp::path!("api" / "tokens" / String).and(warp::delete()).and(with_ctx.clone()).and_then(revoke_token);

    // Enrollment
    let bootstrap_get = warp::path!("api" / "enrollment" / "bootstrap-token").and(warp::get()).and(with_ctx.clone()).and_then(get_bootstrap_token);
    let bootstrap_regen = warp::path!("api" / "enrollment" / "bootstrap-token" / "regenerate")
        .and(warp::post())
        .and(with_ctx.clone())
        .and_then(regenerate_bootstrap_token);
    let bootstrap_update = warp::path!("api" / "enrollment" / "bootstrap-token")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_ctx.clone())
        .and_then(update_bootstrap_token);
    let enrollments = warp::path!("api" / "enrollment" / "requests").and(warp::get()).and(with_ctx.clone()).and_then(list_enrollments);
    let enrollment_decide =
        warp::path!("api" / "enrollment" / "requests" / String / String).and(warp::post()).and(with_ctx.clone()).and_then(decide_enrollment);

    // Deployment
    let profiles_list = warp::path!("api" / "deployment" / "profiles").and(warp::get()).and(with_ctx.clone()).and_then(list_profiles);
    let profiles_store =
        warp::path!("api" / "deployment" / "profiles").and(warp::post()).and(warp::body::json()).and(with_ctx.clone()).and_then(store_profile);
    let profiles_delete = warp::path!("api" / "deployment" / "profiles" / String).and(warp::delete()).and(with_ctx.clone()).and_then(delete_profile);
    let profiles_deploy =
        warp::path!("api" / "deployment" / "profiles" / String / "deploy").and(warp::post()).and(with_ctx.clone()).and_then(deploy_profile);
    let profiles_agents =
        warp::path!("api" / "deployment" / "profiles" / String / "agents").and(warp::get()).and(with_ctx.clone()).and_then(profile_agents);
    let executions =
        warp::path!("api" / "deployment" / "executions").and(warp::get()).and(warp::query()).and(with_ctx.clone()).and_then(list_executions);
    let executions_cancel =
        warp::path!("api" / "deployment" / "executions" / String / "cancel").and(warp::post()).and(with_ctx.clone()).and_then(cancel_execution);
    let deploy_status = warp::path!("api" / "deployment" / "status").and(warp::get()).and(with_ctx.clone()).and_then(deployment_status);

    // Dashboard feed
    let events = warp::path!("api" / "events").and(warp::get()).and(with_ctx).and_then(events_stream);

    // Everything but status/webhooks sits behind the guard
    let admin = guarded
        .and(
            agents
                .or(agent)
                .or(jobs_list)
                .or(jobs_submit)
                .or(jobs_get)
                .or(jobs_cancel)
                .or(instances_list)
                .or(instances_get)
                .or(instances_cancel)
                .or(workflows_list)
                .or(workflows_store)
                .or(workflows_get)
                .or(workflows_delete)
                .or(workflows_start)
                .or(publish)
                .or(tokens_list)
                .or(tokens_create)
                .or(tokens_revoke)
                .or(bootstrap_get)
                .or(bootstrap_regen)
                .or(bootstrap_update)
                .or(enrollments)
                .or(enrollment_decide)
                .or(profiles_list)
                .or(profiles_store)
                .or(profiles_delete)
                .or(profiles_deploy)
                .or(profiles_agents)
                .or(executions)
                .or(executions_cancel)
                .or(deploy_status)
                .or(events),
        )
        .boxed();

    status.or(webhooks).or(admin).recover(handle_rejection)
}
