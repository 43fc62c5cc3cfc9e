//  DISPATCH.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the agent's command router: every envelope from the
//!   host's command stream lands here, gets acknowledged, dispatched to
//!   the matching handler and answered with progress and a terminal
//!   result. Delivery is at-least-once, so a replayed command for a job
//!   the host already closed is simply answered again and deduplicated
//!   host-side.
//

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use specifications::commanding::{CancelJob, Command, CommandKind, ExecuteJob, Ping, Shutdown, UpdateDesiredState};
use specifications::jobs::{JobRequest, JobResult, JobStatus, StreamItem};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::registry::{CommandContext, Handler, HandlerRegistry};
use crate::reporter::Reporter;


/***** LIBRARY *****/
/// The agent's command router.
pub struct CommandRouter {
    /// The local handler registry.
    registry: HandlerRegistry,
    /// The outbound reporting path.
    reporter: Arc<Reporter>,
    /// Cancellation handles of the jobs currently executing.
    running: Arc<DashMap<String, CancellationToken>>,
    /// The desired-state map last pushed by the host.
    desired_state: RwLock<HashMap<String, String>>,
    /// Raised when the host asks the agent to shut down.
    shutdown: watch::Sender<bool>,
}

impl CommandRouter {
    /// Constructor for the CommandRouter.
    ///
    /// # Arguments
    /// - `registry`: The handler registry to dispatch into.
    /// - `reporter`: The outbound reporting path.
    ///
    /// # Returns
    /// The router plus the receiving end of its shutdown signal.
    pub fn new(registry: HandlerRegistry, reporter: Arc<Reporter>) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        (
            Arc::new(Self { registry, reporter, running: Arc::new(DashMap::new()), desired_state: RwLock::new(HashMap::new()), shutdown }),
            shutdown_rx,
        )
    }

    /// Returns the number of jobs currently executing.
    #[inline]
    pub fn running_jobs(&self) -> usize { self.running.len() }

    /// Returns a copy of the desired-state map last pushed by the host.
    #[inline]
    pub fn desired_state(&self) -> HashMap<String, String> { self.desired_state.read().clone() }

    /// Routes one command envelope.
    pub async fn handle(self: &Arc<Self>, command: Command) {
        let kind: CommandKind = match command.into_kind() {
            Ok(kind) => kind,
            Err(err) => {
                warn!("Dropping malformed command envelope: {err}");
                return;
            },
        };

        match kind {
            CommandKind::Execute(execute) => self.handle_execute(execute).await,
            CommandKind::Cancel(CancelJob { job_id, reason }) => {
                info!("Host cancelled job '{job_id}'{}", reason.map(|reason| format!(": {reason}")).unwrap_or_default());
                if let Some(token) = self.running.get(&job_id) {
                    token.cancel();
                } else {
                    debug!("No running job '{job_id}' to cancel");
                }
            },
            CommandKind::Ping(Ping { nonce }) => {
                debug!("Ping from host (nonce {nonce})");
            },
            CommandKind::DesiredState(UpdateDesiredState { desired }) => {
                debug!("Host pushed {} desired-state entr(ies)", desired.len());
                *self.desired_state.write() = desired;
            },
            CommandKind::Shutdown(Shutdown { reason }) => {
                info!("Host asked us to shut down{}", reason.map(|reason| format!(": {reason}")).unwrap_or_default());
                let _ = self.shutdown.send(true);
            },
        }
    }

    /// Handles an execute command: ACK, run the handler, report the result.
    async fn handle_execute(self: &Arc<Self>, execute: ExecuteJob) {
        let request: JobRequest = match JobRequest::try_from(execute) {
            Ok(request) => request,
            Err(err) => {
                warn!("Dropping undecodable execute command: {err}");
                return;
            },
        };
        let job_id: String = request.id.clone();
        info!("Executing job '{job_id}' (command '{}')", request.command);

        // ACK first; the host's dispatch deadline is ticking
        self.reporter.ack(&job_id).await;

        // Run the handler in its own task so the stream pump never blocks
        let router: Arc<Self> = self.clone();
        tokio::spawn(async move {
            let token: CancellationToken = CancellationToken::new();
            router.running.insert(job_id.clone(), token.clone());
            let started: Instant = Instant::now();

            let result: JobResult = match router.registry.get(&request.command) {
                Some(handler) => router.run_handler(handler, request, token.clone(), started).await,
                None => {
                    warn!("No handler for command '{}'", request.command);
                    JobResult::failed(&job_id, format!("no handler for command '{}'", request.command), Some("unknown_command".into()), started.elapsed())
                },
            };

            router.running.remove(&job_id);
            if let Err(err) = router.reporter.result(&result).await {
                error!("Failed to encode result of job '{job_id}': {err}");
            }
        });
    }

    /// Runs one handler to its terminal result, honouring cancellation.
    async fn run_handler(&self, handler: Handler, request: JobRequest, token: CancellationToken, started: Instant) -> JobResult {
        let job_id: String = request.id.clone();
        let ctx: CommandContext = CommandContext::new(request, self.reporter.clone(), token.clone());

        let outcome: Result<Vec<u8>, crate::errors::HandlerError> = tokio::select! {
            outcome = async {
                match handler {
                    Handler::FireAndForget(handler) => handler.run(ctx).await.map(|_| Vec::new()),
                    Handler::RequestResponse(handler) => handler.run(ctx).await,
                    Handler::LongRunning(handler) => handler.run(ctx).await,
                    Handler::Streaming(handler) => {
                        // Forward items with sequence numbers while the handler produces them
                        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
                        let reporter: Arc<Reporter> = self.reporter.clone();
                        let stream_job: String = job_id.clone();
                        let pump = tokio::spawn(async move {
                            let mut sequence: u64 = 0;
                            while let Some(data) = rx.recv().await {
                                reporter.stream_item(&StreamItem { job_id: stream_job.clone(), sequence, data, is_final: false }).await;
                                sequence += 1;
                            }
                            sequence
                        });

                        let outcome = handler.run(ctx, tx).await;
                        let sequence: u64 = pump.await.unwrap_or(0);
                        if outcome.is_ok() {
                            // Close the sequence explicitly
                            self.reporter.stream_item(&StreamItem { job_id: job_id.clone(), sequence, data: Vec::new(), is_final: true }).await;
                        }
                        outcome.map(|_| Vec::new())
                    },
                }
            } => outcome,
            _ = token.cancelled() => {
                let mut result: JobResult = JobResult::completed(&job_id, Vec::new(), started.elapsed());
                result.status = JobStatus::Cancelled;
                result.error = Some("cancelled by host".into());
                return result;
            },
        };

        match outcome {
            Ok(data) => JobResult::completed(&job_id, data, started.elapsed()),
            Err(err) => JobResult::failed(&job_id, err.message, err.code, started.elapsed()),
        }
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::errors::HandlerError;
    use crate::registry::{LongRunningHandler, RequestResponseHandler};

    use super::*;

    /// A handler that echoes its parameters.
    struct Echo;
    #[async_trait]
    impl RequestResponseHandler for Echo {
        async fn run(&self, ctx: CommandContext) -> Result<Vec<u8>, HandlerError> { Ok(ctx.request.parameters.clone()) }
    }

    /// A handler that sleeps until cancelled.
    struct Stuck;
    #[async_trait]
    impl LongRunningHandler for Stuck {
        async fn run(&self, ctx: CommandContext) -> Result<Vec<u8>, HandlerError> {
            ctx.cancel.cancelled().await;
            Err(HandlerError::new("should have been cancelled before this"))
        }
    }

    /// Builds a router over an offline reporter (every report parks in the queue).
    fn router() -> (Arc<CommandRouter>, Arc<Reporter>) {
        let registry: HandlerRegistry = HandlerRegistry::new();
        registry.register("echo", Handler::RequestResponse(Arc::new(Echo)));
        registry.register("stuck", Handler::LongRunning(Arc::new(Stuck)));
        let reporter: Arc<Reporter> = Arc::new(Reporter::new("a1"));
        let (router, _shutdown) = CommandRouter::new(registry, reporter.clone());
        (router, reporter)
    }

    /// Builds an execute envelope for the given command.
    fn execute(job_id: &str, command: &str, parameters: &[u8]) -> Command {
        let mut request: JobRequest = JobRequest::new(command);
        request.id = job_id.into();
        request.parameters = parameters.to_vec();
        Command::new(CommandKind::Execute(ExecuteJob::from(&request)))
    }

    /// Waits until the reporter parked `count` reports.
    async fn await_reports(reporter: &Reporter, count: usize) {
        for _ in 0..200 {
            if reporter.queued() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Expected {count} queued report(s), have {}", reporter.queued());
    }

    #[tokio::test]
    async fn test_execute_acks_then_reports_result() {
        let (router, reporter) = router();
        router.handle(execute("j1", "echo", b"hi")).await;

        // The ACK and the completed result park in order (the reporter is offline)
        await_reports(&reporter, 2).await;
        assert_eq!(reporter.queued(), 2);
        assert_eq!(router.running_jobs(), 0);
    }

    #[tokio::test]
    async fn test_unknown_command_fails_the_job() {
        let (router, reporter) = router();
        router.handle(execute("j1", "nope", b"")).await;
        await_reports(&reporter, 2).await;
        assert_eq!(router.running_jobs(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_job() {
        let (router, reporter) = router();
        router.handle(execute("j1", "stuck", b"")).await;

        // The ACK arrives while the handler hangs
        await_reports(&reporter, 1).await;
        assert_eq!(router.running_jobs(), 1);

        router.handle(Command::new(CommandKind::Cancel(CancelJob { job_id: "j1".into(), reason: None }))).await;
        await_reports(&reporter, 2).await;
        assert_eq!(router.running_jobs(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let registry: HandlerRegistry = HandlerRegistry::new();
        let reporter: Arc<Reporter> = Arc::new(Reporter::new("a1"));
        let (router, mut shutdown) = CommandRouter::new(registry, reporter);

        assert!(!*shutdown.borrow());
        router.handle(Command::new(CommandKind::Shutdown(Shutdown { reason: Some("maintenance".into()) }))).await;
        shutdown.changed().await.unwrap();
        assert!(*shutdown.borrow());
    }

    #[tokio::test]
    async fn test_desired_state_is_stored() {
        let (router, _reporter) = router();
        let desired: HashMap<String, String> = HashMap::from([("log_level".to_string(), "debug".to_string())]);
        router.handle(Command::new(CommandKind::DesiredState(UpdateDesiredState { desired: desired.clone() }))).await;
        assert_eq!(router.desired_state(), desired);
    }
}
