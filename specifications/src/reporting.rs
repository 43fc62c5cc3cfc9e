//  REPORTING.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Contains the prost messages and the hand-written tonic service for
//!   the node -> host surface. Nodes register, heartbeat and report job
//!   progress/results through unary calls; the host -> node command
//!   surface (see `crate::commanding`) is delivered as the server stream
//!   returned by `attach`, which is the persistent half of the session.
//!
//!   Implementation based on the auto-generated version from tonic.
//

use std::collections::HashMap;
use std::error;
use std::fmt::{Display, Formatter, Result as FResult};
use std::sync::Arc;
use std::time::Duration;

pub use ReportingServiceError as Error;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone as _, Utc};
use futures::Stream;
use prost::{Enumeration, Message};
use tonic::body::{BoxBody, empty_body};
use tonic::client::Grpc as GrpcClient;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::{Body, BoxFuture, Context, Poll, Service, StdError, http};
use tonic::server::{Grpc as GrpcServer, NamedService, ServerStreamingService, UnaryService};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};

use crate::agents::{AgentInfo, AgentStatus, Capability};
use crate::commanding::Command;
use crate::jobs::{JobProgress, JobResult, JobStatus, StreamItem};


/***** ERRORS *****/
/// Defines the errors occurring in the ReportingServiceClient or ReportingServiceServer.
#[derive(Debug)]
pub enum ReportingServiceError {
    /// Failed to create an endpoint with the given address.
    EndpointError { address: String, err: tonic::transport::Error },
    /// Failed to connect to the given address.
    ConnectError { address: String, err: tonic::transport::Error },
}
impl Display for ReportingServiceError {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use ReportingServiceError::*;
        match self {
            EndpointError { address, err } => write!(f, "Failed to create a new Endpoint from '{address}': {err}"),
            ConnectError { address, err } => write!(f, "Failed to connect to gRPC endpoint '{address}': {err}"),
        }
    }
}
impl error::Error for ReportingServiceError {}

/// Defines the errors occurring when translating wire reports back into domain types.
#[derive(Debug)]
pub enum ReportConvertError {
    /// The wire outcome value was not a known enumeration member.
    UnknownOutcome { raw: i32 },
    /// The reported state string was not a known agent status.
    UnknownState { raw: String, err: crate::agents::AgentParseError },
}
impl Display for ReportConvertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use ReportConvertError::*;
        match self {
            UnknownOutcome { raw } => write!(f, "Unknown job outcome value '{raw}' in wire report"),
            UnknownState { raw, .. } => write!(f, "Unknown reported agent state '{raw}'"),
        }
    }
}
impl error::Error for ReportConvertError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use ReportConvertError::*;
        match self {
            UnknownOutcome { .. } => None,
            UnknownState { err, .. } => Some(err),
        }
    }
}





/***** AUXILLARY MESSAGES *****/
/// Auxillary enum carrying a job's terminal outcome over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum ReportOutcome {
    /// The handler succeeded.
    Completed = 0,
    /// The handler failed.
    Failed = 1,
    /// The job was cancelled while executing.
    Cancelled = 2,
    /// The handler exceeded its own deadline.
    TimedOut = 3,
}
impl TryFrom<JobStatus> for ReportOutcome {
    type Error = ReportConvertError;

    #[inline]
    fn try_from(value: JobStatus) -> Result<Self, Self::Error> {
        match value {
            JobStatus::Completed => Ok(Self::Completed),
            JobStatus::Failed => Ok(Self::Failed),
            JobStatus::Cancelled => Ok(Self::Cancelled),
            JobStatus::TimedOut => Ok(Self::TimedOut),
            // Non-terminal statuses never travel in a result report
            other => Err(ReportConvertError::UnknownOutcome { raw: other as i32 }),
        }
    }
}
impl From<ReportOutcome> for JobStatus {
    #[inline]
    fn from(value: ReportOutcome) -> Self {
        match value {
            ReportOutcome::Completed => Self::Completed,
            ReportOutcome::Failed => Self::Failed,
            ReportOutcome::Cancelled => Self::Cancelled,
            ReportOutcome::TimedOut => Self::TimedOut,
        }
    }
}



/// Auxillary message carrying one advertised capability.
#[derive(Clone, Message)]
pub struct CapabilityInfo {
    /// The capability's name.
    #[prost(tag = "1", required, string)]
    pub name: String,
    /// Optional implementation version.
    #[prost(tag = "2", optional, string)]
    pub version: Option<String>,
    /// Free-form attributes.
    #[prost(map = "string, string", tag = "3")]
    pub attributes: HashMap<String, String>,
}
impl From<&Capability> for CapabilityInfo {
    #[inline]
    fn from(value: &Capability) -> Self { Self { name: value.name.clone(), version: value.version.clone(), attributes: value.attributes.clone() } }
}
impl From<CapabilityInfo> for Capability {
    #[inline]
    fn from(value: CapabilityInfo) -> Self { Self { name: value.name, version: value.version, attributes: value.attributes } }
}

/// Auxillary message describing a node as it presents itself at registration.
#[derive(Clone, Message)]
pub struct AgentDescriptor {
    /// Unique, stable identifier of the node.
    #[prost(tag = "1", required, string)]
    pub id: String,
    /// Human-readable name.
    #[prost(tag = "2", required, string)]
    pub name: String,
    /// Advertised capabilities.
    #[prost(tag = "3", repeated, message)]
    pub capabilities: Vec<CapabilityInfo>,
    /// Group membership, if any.
    #[prost(tag = "4", optional, string)]
    pub group: Option<String>,
    /// Free-form tags.
    #[prost(tag = "5", repeated, string)]
    pub tags: Vec<String>,
    /// Free-form metadata.
    #[prost(map = "string, string", tag = "6")]
    pub metadata: HashMap<String, String>,
}
impl From<&AgentInfo> for AgentDescriptor {
    fn from(value: &AgentInfo) -> Self {
        Self {
            id: value.id.clone(),
            name: value.name.clone(),
            capabilities: value.capabilities.values().map(CapabilityInfo::from).collect(),
            group: value.group.clone(),
            tags: value.tags.iter().cloned().collect(),
            metadata: value.metadata.clone(),
        }
    }
}
impl From<AgentDescriptor> for AgentInfo {
    fn from(value: AgentDescriptor) -> Self {
        let mut info: AgentInfo = AgentInfo::new(value.id, value.name);
        info.status = AgentStatus::Initializing;
        info.capabilities = value.capabilities.into_iter().map(|cap| (cap.name.clone(), Capability::from(cap))).collect();
        info.group = value.group;
        info.tags = value.tags.into_iter().collect();
        info.metadata = value.metadata;
        info
    }
}





/***** MESSAGES *****/
/// Request for registering a node with the host.
#[derive(Clone, Message)]
pub struct RegisterRequest {
    /// The node describing itself.
    #[prost(tag = "1", required, message)]
    pub agent: AgentDescriptor,
    /// A bootstrap-token secret for first contact, if the node has no access token yet.
    #[prost(tag = "2", optional, string)]
    pub bootstrap_token: Option<String>,
    /// A pre-issued access token, when the node already enrolled once.
    #[prost(tag = "3", optional, string)]
    pub access_token: Option<String>,
}

/// The reply sent by the host when a node registers.
#[derive(Clone, Message)]
pub struct RegisterReply {
    /// Whether the registration was accepted.
    #[prost(tag = "1", required, bool)]
    pub success: bool,
    /// The heartbeat interval the host would like this node to use, in milliseconds.
    #[prost(tag = "2", uint64)]
    pub recommended_heartbeat_interval_ms: u64,
    /// When not successful, the reason.
    #[prost(tag = "3", optional, string)]
    pub error: Option<String>,
}
impl RegisterReply {
    /// Returns the recommended heartbeat interval as a [`Duration`].
    #[inline]
    pub fn recommended_heartbeat_interval(&self) -> Duration { Duration::from_millis(self.recommended_heartbeat_interval_ms) }
}

/// Request for removing a node's registration.
#[derive(Clone, Message)]
pub struct UnregisterRequest {
    /// The node to unregister.
    #[prost(tag = "1", required, string)]
    pub agent_id: String,
}

/// A single heartbeat from a node.
#[derive(Clone, Message)]
pub struct HeartbeatRequest {
    /// The node that is alive.
    #[prost(tag = "1", required, string)]
    pub agent_id: String,
}

/// Acknowledgement that a node received a job.
#[derive(Clone, Message)]
pub struct AcknowledgeRequest {
    /// The job being acknowledged.
    #[prost(tag = "1", required, string)]
    pub job_id: String,
    /// The node acknowledging it.
    #[prost(tag = "2", required, string)]
    pub agent_id: String,
}

/// A terminal job result as reported by a node.
#[derive(Clone, Message)]
pub struct ResultReport {
    /// The job this result belongs to.
    #[prost(tag = "1", required, string)]
    pub job_id: String,
    /// The terminal outcome.
    #[prost(tag = "2", enumeration = "ReportOutcome")]
    pub outcome: i32,
    /// Result payload.
    #[prost(tag = "3", bytes = "vec")]
    pub data: Vec<u8>,
    /// Human-readable error, when not completed.
    #[prost(tag = "4", optional, string)]
    pub error: Option<String>,
    /// Machine-readable error code, when supplied.
    #[prost(tag = "5", optional, string)]
    pub error_code: Option<String>,
    /// Execution duration on the node, in milliseconds.
    #[prost(tag = "6", uint64)]
    pub duration_ms: u64,
    /// When the node finished, as unix milliseconds.
    #[prost(tag = "7", int64)]
    pub finished_at_ms: i64,
    /// The reporting node.
    #[prost(tag = "8", required, string)]
    pub agent_id: String,
}
impl ResultReport {
    /// Builds a wire report from a domain result.
    ///
    /// # Arguments
    /// - `result`: The domain [`JobResult`] to send.
    /// - `agent_id`: The id of the reporting node.
    ///
    /// # Returns
    /// The wire representation.
    ///
    /// # Errors
    /// This function errors if the result's status is not terminal.
    pub fn from_result(result: &JobResult, agent_id: impl Into<String>) -> Result<Self, ReportConvertError> {
        Ok(Self {
            job_id: result.job_id.clone(),
            outcome: ReportOutcome::try_from(result.status)? as i32,
            data: result.data.clone(),
            error: result.error.clone(),
            error_code: result.error_code.clone(),
            duration_ms: result.duration.as_millis() as u64,
            finished_at_ms: result.finished_at.timestamp_millis(),
            agent_id: agent_id.into(),
        })
    }
}
impl TryFrom<ResultReport> for JobResult {
    type Error = ReportConvertError;

    fn try_from(value: ResultReport) -> Result<Self, Self::Error> {
        let outcome: ReportOutcome = match ReportOutcome::try_from(value.outcome) {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(ReportConvertError::UnknownOutcome { raw: value.outcome });
            },
        };
        let finished_at: DateTime<Utc> = Utc.timestamp_millis_opt(value.finished_at_ms).single().unwrap_or_else(Utc::now);
        Ok(Self {
            job_id: value.job_id,
            status: outcome.into(),
            data: value.data,
            error: value.error,
            error_code: value.error_code,
            duration: Duration::from_millis(value.duration_ms),
            finished_at,
        })
    }
}

/// A progress report from a node. The percentage is clamped host-side.
#[derive(Clone, Message)]
pub struct ProgressReport {
    /// The job this progress belongs to.
    #[prost(tag = "1", required, string)]
    pub job_id: String,
    /// Raw reported percentage; the host clamps it into `0..=100`.
    #[prost(tag = "2", int64)]
    pub percentage: i64,
    /// Human-readable progress message.
    #[prost(tag = "3", required, string)]
    pub message: String,
    /// Index of the current step, if reported.
    #[prost(tag = "4", optional, uint32)]
    pub current_step: Option<u32>,
    /// Total number of steps, if reported.
    #[prost(tag = "5", optional, uint32)]
    pub total_steps: Option<u32>,
    /// When the report was produced, as unix milliseconds.
    #[prost(tag = "6", int64)]
    pub timestamp_ms: i64,
    /// The reporting node.
    #[prost(tag = "7", required, string)]
    pub agent_id: String,
}
impl From<ProgressReport> for JobProgress {
    fn from(value: ProgressReport) -> Self {
        let mut progress: JobProgress = JobProgress::new(value.job_id, value.percentage, value.message);
        if let (Some(current), Some(total)) = (value.current_step, value.total_steps) {
            progress = progress.with_steps(current, total);
        }
        if let Some(stamp) = Utc.timestamp_millis_opt(value.timestamp_ms).single() {
            progress.timestamp = stamp;
        }
        progress
    }
}

/// A node reporting its own lifecycle state.
#[derive(Clone, Message)]
pub struct StateReport {
    /// The reporting node.
    #[prost(tag = "1", required, string)]
    pub agent_id: String,
    /// The state the node believes it is in, as the status' string form.
    #[prost(tag = "2", required, string)]
    pub reported_state: String,
}
impl StateReport {
    /// Parses the reported state into an [`AgentStatus`].
    ///
    /// # Errors
    /// This function errors if the string is not a known status.
    pub fn parse_state(&self) -> Result<AgentStatus, ReportConvertError> {
        self.reported_state
            .parse::<AgentStatus>()
            .map_err(|err| ReportConvertError::UnknownState { raw: self.reported_state.clone(), err })
    }
}

/// One item of a streaming job's output.
#[derive(Clone, Message)]
pub struct StreamItemReport {
    /// The job this item belongs to.
    #[prost(tag = "1", required, string)]
    pub job_id: String,
    /// Monotonic sequence number within the stream.
    #[prost(tag = "2", uint64)]
    pub sequence: u64,
    /// The item payload.
    #[prost(tag = "3", bytes = "vec")]
    pub data: Vec<u8>,
    /// Whether this is the final item.
    #[prost(tag = "4", bool)]
    pub is_final: bool,
    /// The reporting node.
    #[prost(tag = "5", required, string)]
    pub agent_id: String,
}
impl From<StreamItemReport> for StreamItem {
    #[inline]
    fn from(value: StreamItemReport) -> Self { Self { job_id: value.job_id, sequence: value.sequence, data: value.data, is_final: value.is_final } }
}

/// Request to attach to the host's command stream. Must follow a successful `register`.
#[derive(Clone, Message)]
pub struct AttachRequest {
    /// The node attaching.
    #[prost(tag = "1", required, string)]
    pub agent_id: String,
}

/// An empty reply for the fire-and-forget report calls.
#[derive(Clone, Message)]
pub struct Empty {}





/***** SERVICES *****/
/// The ReportingServiceClient is the node's handle on the host.
#[derive(Debug, Clone)]
pub struct ReportingServiceClient {
    /// The client with which we actually do everything
    client: GrpcClient<Channel>,
}

impl ReportingServiceClient {
    /// Attempts to connect to the remote endpoint.
    ///
    /// # Arguments
    /// - `address`: The address of the remote endpoint to connect to.
    ///
    /// # Returns
    /// A new ReportingServiceClient instance that is connected to the remote endpoint.
    ///
    /// # Errors
    /// This function errors if the connection could not be established for whatever reason.
    pub async fn connect(address: impl Into<String>) -> Result<Self, Error> {
        let address: String = address.into();

        // Attempt to make the connection
        let conn: Channel = match Endpoint::new(address.clone()) {
            Ok(endpoint) => match endpoint.connect().await {
                Ok(conn) => conn,
                Err(err) => {
                    return Err(Error::ConnectError { address, err });
                },
            },
            Err(err) => {
                return Err(Error::EndpointError { address, err });
            },
        };

        // Store it internally
        Ok(Self { client: GrpcClient::new(conn) })
    }

    /// Performs a unary call to the given path.
    async fn unary<I: Message + 'static, O: Message + Default + 'static>(
        &mut self,
        path: &'static str,
        request: impl tonic::IntoRequest<I>,
    ) -> Result<Response<O>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static(path);
        self.client.unary(request.into_request(), path, codec).await
    }

    /// Registers the node with the host.
    ///
    /// # Arguments
    /// - `request`: The [`RegisterRequest`] to send to the host.
    ///
    /// # Returns
    /// The [`RegisterReply`] the host returns.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn register(&mut self, request: impl tonic::IntoRequest<RegisterRequest>) -> Result<Response<RegisterReply>, Status> {
        self.unary("/orbitmesh.ReportingService/Register", request).await
    }

    /// Removes the node's registration.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn unregister(&mut self, request: impl tonic::IntoRequest<UnregisterRequest>) -> Result<Response<Empty>, Status> {
        self.unary("/orbitmesh.ReportingService/Unregister", request).await
    }

    /// Sends a heartbeat.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn heartbeat(&mut self, request: impl tonic::IntoRequest<HeartbeatRequest>) -> Result<Response<Empty>, Status> {
        self.unary("/orbitmesh.ReportingService/Heartbeat", request).await
    }

    /// Acknowledges receipt of a job.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn acknowledge_job(&mut self, request: impl tonic::IntoRequest<AcknowledgeRequest>) -> Result<Response<Empty>, Status> {
        self.unary("/orbitmesh.ReportingService/AcknowledgeJob", request).await
    }

    /// Reports a terminal job result.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn report_result(&mut self, request: impl tonic::IntoRequest<ResultReport>) -> Result<Response<Empty>, Status> {
        self.unary("/orbitmesh.ReportingService/ReportResult", request).await
    }

    /// Reports job progress.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn report_progress(&mut self, request: impl tonic::IntoRequest<ProgressReport>) -> Result<Response<Empty>, Status> {
        self.unary("/orbitmesh.ReportingService/ReportProgress", request).await
    }

    /// Reports the node's own lifecycle state.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn report_state(&mut self, request: impl tonic::IntoRequest<StateReport>) -> Result<Response<Empty>, Status> {
        self.unary("/orbitmesh.ReportingService/ReportState", request).await
    }

    /// Reports one item of a streaming job's output.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn report_stream_item(&mut self, request: impl tonic::IntoRequest<StreamItemReport>) -> Result<Response<Empty>, Status> {
        self.unary("/orbitmesh.ReportingService/ReportStreamItem", request).await
    }

    /// Attaches to the host's command stream for this node.
    ///
    /// # Arguments
    /// - `request`: The [`AttachRequest`] naming the (already registered) node.
    ///
    /// # Returns
    /// A stream of [`Command`] envelopes that lives for the duration of the session.
    ///
    /// # Errors
    /// This function errors if either we failed to send the request or the host itself failed to process it.
    pub async fn attach(&mut self, request: impl tonic::IntoRequest<AttachRequest>) -> Result<Response<Streaming<Command>>, Status> {
        // Assert the client is ready to get the party started
        if let Err(err) = self.client.ready().await {
            return Err(Status::new(Code::Unknown, format!("Service was not ready: {err}")));
        }

        // Set the default stuff
        let codec: ProstCodec<_, _> = ProstCodec::default();
        let path: http::uri::PathAndQuery = http::uri::PathAndQuery::from_static("/orbitmesh.ReportingService/Attach");
        self.client.server_streaming(request.into_request(), path, codec).await
    }
}



/// The ReportingService is a trait for easily writing the host side of the node protocol.
///
/// Implementation based on the auto-generated version from tonic.
#[async_trait]
pub trait ReportingService: 'static + Send + Sync {
    /// The response type for the stream returned by `ReportingService::attach()`.
    type AttachStream: 'static + Send + Stream<Item = Result<Command, Status>>;


    /// Handle for when a [`RegisterRequest`] comes in.
    ///
    /// # Arguments
    /// - `request`: The ([`tonic::Request`]-wrapped) [`RegisterRequest`] containing the relevant details.
    ///
    /// # Returns
    /// A [`RegisterReply`] for this request, wrapped in a [`tonic::Response`].
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<RegisterReply>, Status>;

    /// Handle for when an [`UnregisterRequest`] comes in.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn unregister(&self, request: Request<UnregisterRequest>) -> Result<Response<Empty>, Status>;

    /// Handle for when a [`HeartbeatRequest`] comes in.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<Empty>, Status>;

    /// Handle for when an [`AcknowledgeRequest`] comes in.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn acknowledge_job(&self, request: Request<AcknowledgeRequest>) -> Result<Response<Empty>, Status>;

    /// Handle for when a [`ResultReport`] comes in.
    ///
    /// Duplicate terminal reports for the same job must be accepted idempotently.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn report_result(&self, request: Request<ResultReport>) -> Result<Response<Empty>, Status>;

    /// Handle for when a [`ProgressReport`] comes in.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn report_progress(&self, request: Request<ProgressReport>) -> Result<Response<Empty>, Status>;

    /// Handle for when a [`StateReport`] comes in.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn report_state(&self, request: Request<StateReport>) -> Result<Response<Empty>, Status>;

    /// Handle for when a [`StreamItemReport`] comes in.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn report_stream_item(&self, request: Request<StreamItemReport>) -> Result<Response<Empty>, Status>;

    /// Handle for when an [`AttachRequest`] comes in.
    ///
    /// # Arguments
    /// - `request`: The (`tonic::Request`-wrapped) AttachRequest naming the registered node.
    ///
    /// # Returns
    /// A stream of [`Command`] envelopes; the host pushes commands for the node onto it for as
    /// long as the session lives.
    ///
    /// # Errors
    /// This function may error (i.e., send back a `tonic::Status`) whenever it fails.
    async fn attach(&self, request: Request<AttachRequest>) -> Result<Response<Self::AttachStream>, Status>;
}

/// The ReportingServiceServer hosts the server part of the ReportingService protocol.
#[derive(Clone, Debug)]
pub struct ReportingServiceServer<T> {
    /// The service that we host.
    service: Arc<T>,
}

impl<T> ReportingServiceServer<T> {
    /// Constructor for the ReportingServiceServer.
    ///
    /// # Arguments
    /// - `service`: The Service to serve.
    ///
    /// # Returns
    /// A new ReportingServiceServer instance.
    #[inline]
    pub fn new(service: T) -> Self { Self { service: Arc::new(service) } }
}

/// Expands to the unary-path match arm for the hand-written server below.
macro_rules! unary_route {
    ($service:expr, $req:expr, $handler:ident, $request:ty, $reply:ty) => {{
        /// Helper struct for the given ReportingService that focusses specifically on this request.
        struct Svc<T>(Arc<T>);
        impl<T: ReportingService> UnaryService<$request> for Svc<T> {
            type Future = BoxFuture<Response<Self::Response>, Status>;
            type Response = $reply;

            fn call(&mut self, req: Request<$request>) -> Self::Future {
                // Return the service function as the future to run
                let service = self.0.clone();
                let fut = async move { (*service).$handler(req).await };
                Box::pin(fut)
            }
        }

        // Create a future that creates the service
        let service = $service.clone();
        Box::pin(async move {
            let method: Svc<T> = Svc(service);
            let codec: ProstCodec<_, _> = ProstCodec::default();
            let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
            Ok(grpc.unary(method, $req).await)
        })
    }};
}

impl<T, B> Service<http::Request<B>> for ReportingServiceServer<T>
where
    T: ReportingService,
    B: 'static + Send + Body,
    B::Error: 'static + Send + Into<StdError>,
{
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;
    type Response = http::Response<BoxBody>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> { Poll::Ready(Ok(())) }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            "/orbitmesh.ReportingService/Register" => unary_route!(self.service, req, register, RegisterRequest, RegisterReply),
            "/orbitmesh.ReportingService/Unregister" => unary_route!(self.service, req, unregister, UnregisterRequest, Empty),
            "/orbitmesh.ReportingService/Heartbeat" => unary_route!(self.service, req, heartbeat, HeartbeatRequest, Empty),
            "/orbitmesh.ReportingService/AcknowledgeJob" => unary_route!(self.service, req, acknowledge_job, AcknowledgeRequest, Empty),
            "/orbitmesh.ReportingService/ReportResult" => unary_route!(self.service, req, report_result, ResultReport, Empty),
            "/orbitmesh.ReportingService/ReportProgress" => unary_route!(self.service, req, report_progress, ProgressReport, Empty),
            "/orbitmesh.ReportingService/ReportState" => unary_route!(self.service, req, report_state, StateReport, Empty),
            "/orbitmesh.ReportingService/ReportStreamItem" => unary_route!(self.service, req, report_stream_item, StreamItemReport, Empty),

            // Incoming AttachRequest (the only streaming call)
            "/orbitmesh.ReportingService/Attach" => {
                /// Helper struct for the given ReportingService that focusses specifically on this request.
                struct AttachSvc<T>(Arc<T>);
                impl<T: ReportingService> ServerStreamingService<AttachRequest> for AttachSvc<T> {
                    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;
                    type Response = Command;
                    type ResponseStream = T::AttachStream;

                    fn call(&mut self, req: Request<AttachRequest>) -> Self::Future {
                        // Return the service function as the future to run
                        let service = self.0.clone();
                        let fut = async move { (*service).attach(req).await };
                        Box::pin(fut)
                    }
                }

                // Create a future that creates the service
                let service = self.service.clone();
                Box::pin(async move {
                    let method: AttachSvc<T> = AttachSvc(service);
                    let codec: ProstCodec<_, _> = ProstCodec::default();
                    let mut grpc: GrpcServer<ProstCodec<_, _>> = GrpcServer::new(codec);
                    Ok(grpc.server_streaming(method, req).await)
                })
            },

            // Other (boring) request types
            _ => {
                // Return a future that simply does ¯\_(ツ)_/¯
                Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .unwrap())
                })
            },
        }
    }
}
impl<T: ReportingService> NamedService for ReportingServiceServer<T> {
    const NAME: &'static str = "orbitmesh.ReportingService";
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    #[test]
    fn test_result_report_roundtrip() {
        let result: JobResult = JobResult::failed("j1", "boom", Some("E42".into()), Duration::from_millis(1500));
        let wire: ResultReport = ResultReport::from_result(&result, "agent-1").unwrap();

        let mut buf: Vec<u8> = Vec::new();
        wire.encode(&mut buf).unwrap();
        let back: JobResult = JobResult::try_from(ResultReport::decode(buf.as_slice()).unwrap()).unwrap();

        assert_eq!(back.job_id, "j1");
        assert_eq!(back.status, JobStatus::Failed);
        assert_eq!(back.error.as_deref(), Some("boom"));
        assert_eq!(back.error_code.as_deref(), Some("E42"));
        assert_eq!(back.duration, Duration::from_millis(1500));
        assert_eq!(back.finished_at.timestamp_millis(), result.finished_at.timestamp_millis());
    }

    #[test]
    fn test_result_report_rejects_non_terminal() {
        let mut result: JobResult = JobResult::completed("j1", vec![], Duration::ZERO);
        result.status = JobStatus::Running;
        assert!(matches!(ResultReport::from_result(&result, "agent-1"), Err(ReportConvertError::UnknownOutcome { .. })));
    }

    #[test]
    fn test_progress_report_clamps() {
        let wire: ProgressReport = ProgressReport {
            job_id: "j1".into(),
            percentage: 250,
            message: "almost".into(),
            current_step: Some(2),
            total_steps: Some(3),
            timestamp_ms: Utc::now().timestamp_millis(),
            agent_id: "agent-1".into(),
        };
        let progress: JobProgress = wire.into();
        assert_eq!(progress.percentage(), 100);
        assert_eq!(progress.current_step, Some(2));
        assert_eq!(progress.total_steps, Some(3));
    }

    #[test]
    fn test_agent_descriptor_roundtrip() {
        let mut info: AgentInfo = AgentInfo::new("a1", "node-1");
        info.capabilities.insert("shell".into(), Capability::named("shell"));
        info.group = Some("builders".into());
        info.tags.insert("region:eu".into());
        info.metadata.insert("weight".into(), "3".into());

        let wire: AgentDescriptor = AgentDescriptor::from(&info);
        let mut buf: Vec<u8> = Vec::new();
        wire.encode(&mut buf).unwrap();
        let back: AgentInfo = AgentDescriptor::decode(buf.as_slice()).unwrap().into();

        assert_eq!(back.id, "a1");
        assert_eq!(back.name, "node-1");
        assert!(back.capabilities.contains_key("shell"));
        assert_eq!(back.group.as_deref(), Some("builders"));
        assert!(back.tags.contains("region:eu"));
        assert_eq!(back.metadata.get("weight").map(String::as_str), Some("3"));
        assert_eq!(back.status, AgentStatus::Initializing);
        assert!(back.connection_id.is_none());
    }

    #[test]
    fn test_state_report_parse() {
        let report: StateReport = StateReport { agent_id: "a1".into(), reported_state: "paused".into() };
        assert_eq!(report.parse_state().unwrap(), AgentStatus::Paused);
        let report: StateReport = StateReport { agent_id: "a1".into(), reported_state: "levitating".into() };
        assert!(report.parse_state().is_err());
    }
}
