//  REGISTRY.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the agent's handler registry: the map from command
//!   strings to the handler that executes them, in one of the four
//!   interaction patterns (fire-and-forget, request/response, streaming,
//!   long-running).
//

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use specifications::jobs::{JobPattern, JobProgress, JobRequest, StreamItem};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::HandlerError;
use crate::reporter::Reporter;


/***** AUXILLARY *****/
/// A handle a long-running handler reports its progress through.
#[derive(Clone)]
pub struct ProgressHandle {
    /// The job the progress belongs to.
    job_id: String,
    /// The agent's reporting path.
    reporter: Arc<Reporter>,
}
impl ProgressHandle {
    /// Reports a progress percentage with a message.
    ///
    /// # Arguments
    /// - `percentage`: The progress percentage (clamped host-side).
    /// - `message`: A human-readable progress message.
    pub async fn report(&self, percentage: i64, message: impl Into<String>) {
        self.reporter.progress(&JobProgress::new(&self.job_id, percentage, message)).await;
    }

    /// Reports progress with step counters.
    pub async fn report_step(&self, current: u32, total: u32, message: impl Into<String>) {
        let percentage: i64 = if total == 0 { 0 } else { (current as i64 * 100) / total as i64 };
        self.reporter.progress(&JobProgress::new(&self.job_id, percentage, message).with_steps(current, total)).await;
    }
}

/// Everything a handler gets to work with.
pub struct CommandContext {
    /// The job being executed.
    pub job_id: String,
    /// The full request, parameters included.
    pub request: JobRequest,
    /// Progress reporting (meaningful for long-running handlers).
    pub progress: ProgressHandle,
    /// Cancelled when the host cancels the job; handlers must honour it.
    pub cancel: CancellationToken,
}
impl CommandContext {
    /// Builds a context for the given request.
    pub fn new(request: JobRequest, reporter: Arc<Reporter>, cancel: CancellationToken) -> Self {
        let job_id: String = request.id.clone();
        Self { progress: ProgressHandle { job_id: job_id.clone(), reporter }, job_id, request, cancel }
    }

    /// Parses the request parameters as JSON.
    ///
    /// # Errors
    /// This function errors if the payload is not valid JSON.
    pub fn params_json(&self) -> Result<serde_json::Value, HandlerError> {
        if self.request.parameters.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.request.parameters).map_err(|err| HandlerError::with_code(format!("invalid parameters: {err}"), "bad_params"))
    }
}





/***** HANDLER TRAITS *****/
/// A handler that runs and reports nothing but its terminal state.
#[async_trait]
pub trait FireAndForgetHandler: 'static + Send + Sync {
    /// Runs the command.
    ///
    /// # Errors
    /// This function errors if the command failed; the error travels back on the job result.
    async fn run(&self, ctx: CommandContext) -> Result<(), HandlerError>;
}

/// A handler that returns a single reply payload.
#[async_trait]
pub trait RequestResponseHandler: 'static + Send + Sync {
    /// Runs the command and produces the reply payload.
    ///
    /// # Errors
    /// This function errors if the command failed; the error travels back on the job result.
    async fn run(&self, ctx: CommandContext) -> Result<Vec<u8>, HandlerError>;
}

/// A handler that produces a finite sequence of stream items.
#[async_trait]
pub trait StreamingHandler: 'static + Send + Sync {
    /// Runs the command, pushing items onto `out` as they become available. The dispatcher
    /// assigns sequence numbers and marks the final item.
    ///
    /// # Errors
    /// This function errors if the command failed; items already pushed stay delivered.
    async fn run(&self, ctx: CommandContext, out: mpsc::Sender<Vec<u8>>) -> Result<(), HandlerError>;
}

/// A handler that runs for a while, reporting progress before its terminal result.
#[async_trait]
pub trait LongRunningHandler: 'static + Send + Sync {
    /// Runs the command, reporting progress through `ctx.progress`.
    ///
    /// # Errors
    /// This function errors if the command failed; the error travels back on the job result.
    async fn run(&self, ctx: CommandContext) -> Result<Vec<u8>, HandlerError>;
}

/// A registered handler, in whichever pattern it speaks.
#[derive(Clone)]
pub enum Handler {
    /// Executes and reports nothing but its terminal state.
    FireAndForget(Arc<dyn FireAndForgetHandler>),
    /// Returns a single reply payload.
    RequestResponse(Arc<dyn RequestResponseHandler>),
    /// Produces a finite sequence of stream items.
    Streaming(Arc<dyn StreamingHandler>),
    /// Emits progress before its terminal result.
    LongRunning(Arc<dyn LongRunningHandler>),
}
impl Handler {
    /// Returns the pattern this handler speaks.
    #[inline]
    pub fn pattern(&self) -> JobPattern {
        match self {
            Self::FireAndForget(_) => JobPattern::FireAndForget,
            Self::RequestResponse(_) => JobPattern::RequestResponse,
            Self::Streaming(_) => JobPattern::Streaming,
            Self::LongRunning(_) => JobPattern::LongRunning,
        }
    }
}

/// Re-exported for handlers producing stream items manually.
pub type StreamSink = mpsc::Sender<StreamItem>;





/***** LIBRARY *****/
/// The agent's command -> handler map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    /// The handlers, keyed by command string.
    handlers: Arc<DashMap<String, Handler>>,
}
impl HandlerRegistry {
    /// Constructor for an empty HandlerRegistry.
    #[inline]
    pub fn new() -> Self { Self::default() }

    /// Registers a handler for the given command, replacing any previous one.
    #[inline]
    pub fn register(&self, command: impl Into<String>, handler: Handler) { self.handlers.insert(command.into(), handler); }

    /// Looks a handler up by command.
    #[inline]
    pub fn get(&self, command: &str) -> Option<Handler> { self.handlers.get(command).map(|handler| handler.clone()) }

    /// Returns the registered command names (advertised as the agent's capabilities).
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        commands.sort();
        commands
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    /// A handler that echoes its parameters.
    struct Echo;
    #[async_trait]
    impl RequestResponseHandler for Echo {
        async fn run(&self, ctx: CommandContext) -> Result<Vec<u8>, HandlerError> { Ok(ctx.request.parameters.clone()) }
    }

    #[tokio::test]
    async fn test_register_lookup_and_run() {
        let registry: HandlerRegistry = HandlerRegistry::new();
        registry.register("echo", Handler::RequestResponse(Arc::new(Echo)));

        assert!(registry.get("nope").is_none());
        let handler: Handler = registry.get("echo").unwrap();
        assert_eq!(handler.pattern(), JobPattern::RequestResponse);
        assert_eq!(registry.commands(), vec!["echo".to_string()]);

        let mut request: JobRequest = JobRequest::new("echo");
        request.parameters = b"hello".to_vec();
        let ctx: CommandContext = CommandContext::new(request, Arc::new(Reporter::new("a1")), CancellationToken::new());
        match handler {
            Handler::RequestResponse(echo) => assert_eq!(echo.run(ctx).await.unwrap(), b"hello".to_vec()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_params_json() {
        let mut request: JobRequest = JobRequest::new("echo");
        request.parameters = br#"{"n": 3}"#.to_vec();
        let ctx: CommandContext = CommandContext::new(request, Arc::new(Reporter::new("a1")), CancellationToken::new());
        assert_eq!(ctx.params_json().unwrap()["n"], serde_json::json!(3));

        let mut request: JobRequest = JobRequest::new("echo");
        request.parameters = b"not json".to_vec();
        let ctx: CommandContext = CommandContext::new(request, Arc::new(Reporter::new("a1")), CancellationToken::new());
        assert!(ctx.params_json().is_err());
    }
}
