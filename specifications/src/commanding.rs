//  COMMANDING.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Contains the prost messages for the host -> node command surface.
//!   Commands are not a separate RPC service; they travel over the
//!   server-streaming `attach` call of the reporting service (see
//!   `crate::reporting`), wrapped in the [`Command`] envelope defined
//!   here. The integer field tags are the wire contract; changing them
//!   breaks node interoperability.
//

use std::collections::HashMap;
use std::error;
use std::fmt::{Display, Formatter, Result as FResult};
use std::time::Duration;

use prost::{Enumeration, Message, Oneof};

use crate::jobs::{JobPattern, JobRequest};


/***** ERRORS *****/
/// Defines the errors occurring when translating wire commands back into domain types.
#[derive(Debug)]
pub enum CommandConvertError {
    /// The wire pattern value was not a known enumeration member.
    UnknownPattern { raw: i32 },
    /// The command envelope carried no payload.
    EmptyEnvelope,
}
impl Display for CommandConvertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use CommandConvertError::*;
        match self {
            UnknownPattern { raw } => write!(f, "Unknown execution pattern value '{raw}' in wire command"),
            EmptyEnvelope => write!(f, "Received command envelope without a payload"),
        }
    }
}
impl error::Error for CommandConvertError {}





/***** AUXILLARY MESSAGES *****/
/// Auxillary enum carrying the job's execution pattern over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum WirePattern {
    /// The command is sent and no reply is expected.
    FireAndForget = 0,
    /// The command returns a single reply payload.
    RequestResponse = 1,
    /// The command yields a finite sequence of stream items.
    Streaming = 2,
    /// The command runs for a while before a terminal result.
    LongRunning = 3,
}
impl From<JobPattern> for WirePattern {
    #[inline]
    fn from(value: JobPattern) -> Self {
        match value {
            JobPattern::FireAndForget => Self::FireAndForget,
            JobPattern::RequestResponse => Self::RequestResponse,
            JobPattern::Streaming => Self::Streaming,
            JobPattern::LongRunning => Self::LongRunning,
        }
    }
}
impl From<WirePattern> for JobPattern {
    #[inline]
    fn from(value: WirePattern) -> Self {
        match value {
            WirePattern::FireAndForget => Self::FireAndForget,
            WirePattern::RequestResponse => Self::RequestResponse,
            WirePattern::Streaming => Self::Streaming,
            WirePattern::LongRunning => Self::LongRunning,
        }
    }
}





/***** MESSAGES *****/
/// Command that tells a node to execute a job.
#[derive(Clone, Message)]
pub struct ExecuteJob {
    /// Unique id of the job.
    #[prost(tag = "1", required, string)]
    pub id: String,
    /// The caller's idempotency key, if one was explicitly supplied.
    #[prost(tag = "2", optional, string)]
    pub idempotency_key: Option<String>,
    /// The command to execute.
    #[prost(tag = "3", required, string)]
    pub command: String,
    /// The execution pattern of the command.
    #[prost(tag = "4", enumeration = "WirePattern")]
    pub pattern: i32,
    /// Opaque parameter payload.
    #[prost(tag = "5", bytes = "vec")]
    pub parameters: Vec<u8>,
    /// Scheduling priority; higher first.
    #[prost(tag = "6", int32)]
    pub priority: i32,
    /// Execution timeout in milliseconds, if any.
    #[prost(tag = "7", optional, uint64)]
    pub timeout_ms: Option<u64>,
    /// How often the job may be retried.
    #[prost(tag = "8", uint32)]
    pub max_retries: u32,
    /// Correlates the job with an external flow.
    #[prost(tag = "9", optional, string)]
    pub correlation_id: Option<String>,
    /// Free-form metadata.
    #[prost(map = "string, string", tag = "10")]
    pub metadata: HashMap<String, String>,
}
impl From<&JobRequest> for ExecuteJob {
    fn from(value: &JobRequest) -> Self {
        Self {
            id: value.id.clone(),
            idempotency_key: value.idempotency_key.clone(),
            command: value.command.clone(),
            pattern: WirePattern::from(value.pattern) as i32,
            parameters: value.parameters.clone(),
            priority: value.priority,
            timeout_ms: value.timeout.map(|t| t.as_millis() as u64),
            max_retries: value.max_retries,
            correlation_id: value.correlation_id.clone(),
            metadata: value.metadata.clone(),
        }
    }
}
impl TryFrom<ExecuteJob> for JobRequest {
    type Error = CommandConvertError;

    fn try_from(value: ExecuteJob) -> Result<Self, Self::Error> {
        let pattern: WirePattern = match WirePattern::try_from(value.pattern) {
            Ok(pattern) => pattern,
            Err(_) => {
                return Err(CommandConvertError::UnknownPattern { raw: value.pattern });
            },
        };
        Ok(Self {
            id: value.id,
            idempotency_key: value.idempotency_key,
            command: value.command,
            pattern: pattern.into(),
            parameters: value.parameters,
            priority: value.priority,
            timeout: value.timeout_ms.map(Duration::from_millis),
            max_retries: value.max_retries,
            // Targeting was already resolved on the host; the node does not see it
            target_agent_id: None,
            required_capabilities: Default::default(),
            required_tags: Default::default(),
            correlation_id: value.correlation_id,
            metadata: value.metadata,
        })
    }
}



/// Command that tells a node to abort a job it is holding.
#[derive(Clone, Message)]
pub struct CancelJob {
    /// The id of the job to cancel.
    #[prost(tag = "1", required, string)]
    pub job_id: String,
    /// Optional human-readable reason.
    #[prost(tag = "2", optional, string)]
    pub reason: Option<String>,
}

/// Liveness probe from the host.
#[derive(Clone, Message)]
pub struct Ping {
    /// Opaque nonce the node may log.
    #[prost(tag = "1", uint64)]
    pub nonce: u64,
}

/// Command that pushes a new desired-state map to the node.
#[derive(Clone, Message)]
pub struct UpdateDesiredState {
    /// The desired state entries.
    #[prost(map = "string, string", tag = "1")]
    pub desired: HashMap<String, String>,
}

/// Command that asks the node to shut down.
#[derive(Clone, Message)]
pub struct Shutdown {
    /// Why the node is being shut down.
    #[prost(tag = "1", optional, string)]
    pub reason: Option<String>,
}



/// Auxillary enum over all possible command payloads.
#[derive(Clone, Oneof)]
pub enum CommandKind {
    /// Execute a job.
    #[prost(tag = "1", message)]
    Execute(ExecuteJob),
    /// Cancel a job.
    #[prost(tag = "2", message)]
    Cancel(CancelJob),
    /// Liveness probe.
    #[prost(tag = "3", message)]
    Ping(Ping),
    /// Push a new desired state.
    #[prost(tag = "4", message)]
    DesiredState(UpdateDesiredState),
    /// Ask the node to shut down.
    #[prost(tag = "5", message)]
    Shutdown(Shutdown),
}

/// The envelope for every host -> node command.
#[derive(Clone, Message)]
pub struct Command {
    /// The actual command payload.
    #[prost(tags = "1,2,3,4,5", oneof = "CommandKind")]
    pub kind: Option<CommandKind>,
}
impl Command {
    /// Wraps the given kind in an envelope.
    #[inline]
    pub fn new(kind: CommandKind) -> Self { Self { kind: Some(kind) } }

    /// Unwraps the envelope, erroring if it was empty.
    ///
    /// # Returns
    /// The inner [`CommandKind`].
    ///
    /// # Errors
    /// This function errors if the envelope carried no payload (which means a protocol mismatch).
    #[inline]
    pub fn into_kind(self) -> Result<CommandKind, CommandConvertError> { self.kind.ok_or(CommandConvertError::EmptyEnvelope) }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prost::Message as _;

    use super::*;

    #[test]
    fn test_execute_job_wire_roundtrip() {
        let mut request: JobRequest = JobRequest::new("echo");
        request.idempotency_key = Some("k1".into());
        request.pattern = JobPattern::LongRunning;
        request.parameters = b"hi".to_vec();
        request.priority = -3;
        request.timeout = Some(Duration::from_secs(5));
        request.max_retries = 2;
        request.correlation_id = Some("corr".into());
        request.metadata.insert("origin".into(), "test".into());

        // Encode, decode, convert back
        let wire: ExecuteJob = ExecuteJob::from(&request);
        let mut buf: Vec<u8> = Vec::new();
        wire.encode(&mut buf).unwrap();
        let back: ExecuteJob = ExecuteJob::decode(buf.as_slice()).unwrap();
        let domain: JobRequest = JobRequest::try_from(back).unwrap();

        assert_eq!(domain.id, request.id);
        assert_eq!(domain.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(domain.command, "echo");
        assert_eq!(domain.pattern, JobPattern::LongRunning);
        assert_eq!(domain.parameters, b"hi".to_vec());
        assert_eq!(domain.priority, -3);
        assert_eq!(domain.timeout, Some(Duration::from_secs(5)));
        assert_eq!(domain.max_retries, 2);
        assert_eq!(domain.correlation_id.as_deref(), Some("corr"));
        assert_eq!(domain.metadata.get("origin").map(String::as_str), Some("test"));
        assert_eq!(domain.required_capabilities, HashSet::new());
    }

    #[test]
    fn test_command_envelope_roundtrip() {
        let cmd: Command = Command::new(CommandKind::Cancel(CancelJob { job_id: "j1".into(), reason: Some("operator".into()) }));
        let mut buf: Vec<u8> = Vec::new();
        cmd.encode(&mut buf).unwrap();
        let back: Command = Command::decode(buf.as_slice()).unwrap();
        match back.into_kind().unwrap() {
            CommandKind::Cancel(cancel) => {
                assert_eq!(cancel.job_id, "j1");
                assert_eq!(cancel.reason.as_deref(), Some("operator"));
            },
            other => panic!("Expected CommandKind::Cancel, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_envelope_is_an_error() {
        let cmd: Command = Command { kind: None };
        assert!(matches!(cmd.into_kind(), Err(CommandConvertError::EmptyEnvelope)));
    }
}
