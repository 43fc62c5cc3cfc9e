//  HANDLERS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the agent's built-in handlers. The real capability
//!   handlers (filesystem, service control, shell, update) ship as
//!   separate capability crates; what lives here is the small set used
//!   to exercise and verify the execution loop end to end.
//

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use tokio::sync::mpsc;

use crate::errors::HandlerError;
use crate::registry::{CommandContext, Handler, HandlerRegistry, LongRunningHandler, RequestResponseHandler, StreamingHandler};


/***** LIBRARY *****/
/// Echoes the request parameters back as the reply.
pub struct EchoHandler;
#[async_trait]
impl RequestResponseHandler for EchoHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Vec<u8>, HandlerError> { Ok(ctx.request.parameters.clone()) }
}

/// Sleeps for `{"millis": n}`, reporting progress along the way. Honours cancellation.
pub struct SleepHandler;
#[async_trait]
impl LongRunningHandler for SleepHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Vec<u8>, HandlerError> {
        let params: serde_json::Value = ctx.params_json()?;
        let millis: u64 = params.get("millis").and_then(serde_json::Value::as_u64).unwrap_or(1000);

        // Sleep in ten slices so the host sees movement
        let slice: Duration = Duration::from_millis((millis / 10).max(1));
        for step in 1..=10u32 {
            tokio::select! {
                _ = tokio::time::sleep(slice) => {},
                _ = ctx.cancel.cancelled() => {
                    return Err(HandlerError::with_code("sleep interrupted", "cancelled"));
                },
            }
            ctx.progress.report_step(step, 10, format!("slept {step}/10")).await;
        }
        Ok(Vec::new())
    }
}

/// Fails the first `{"fail_times": n}` calls of this process, then succeeds; used to
/// exercise the retry path.
#[derive(Default)]
pub struct FlakyHandler {
    /// How often this handler ran already.
    calls: AtomicU32,
}
#[async_trait]
impl RequestResponseHandler for FlakyHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Vec<u8>, HandlerError> {
        let params: serde_json::Value = ctx.params_json()?;
        let fail_times: u32 = params.get("fail_times").and_then(serde_json::Value::as_u64).unwrap_or(1) as u32;

        let call: u32 = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < fail_times {
            return Err(HandlerError::with_code(format!("flaky failure {} of {fail_times}", call + 1), "flaky"));
        }
        Ok(b"ok".to_vec())
    }
}

/// Streams the numbers `1..={"count": n}` as items.
pub struct CountHandler;
#[async_trait]
impl StreamingHandler for CountHandler {
    async fn run(&self, ctx: CommandContext, out: mpsc::Sender<Vec<u8>>) -> Result<(), HandlerError> {
        let params: serde_json::Value = ctx.params_json()?;
        let count: u64 = params.get("count").and_then(serde_json::Value::as_u64).unwrap_or(10);

        for i in 1..=count {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::with_code("count interrupted", "cancelled"));
            }
            if out.send(i.to_string().into_bytes()).await.is_err() {
                // The dispatcher went away; nothing left to stream for
                break;
            }
        }
        Ok(())
    }
}



/// Registers the built-in handlers.
///
/// # Arguments
/// - `registry`: The registry to register into.
pub fn register_builtins(registry: &HandlerRegistry) {
    registry.register("echo", Handler::RequestResponse(Arc::new(EchoHandler)));
    registry.register("sleep", Handler::LongRunning(Arc::new(SleepHandler)));
    registry.register("flaky", Handler::RequestResponse(Arc::new(FlakyHandler::default())));
    registry.register("count", Handler::Streaming(Arc::new(CountHandler)));
    info!("Registered {} built-in handler(s)", registry.commands().len());
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use specifications::jobs::JobRequest;
    use tokio_util::sync::CancellationToken;

    use crate::reporter::Reporter;

    use super::*;

    /// Builds a context for the given command and JSON parameters.
    fn ctx(command: &str, params: serde_json::Value) -> CommandContext {
        let mut request: JobRequest = JobRequest::new(command);
        request.parameters = serde_json::to_vec(&params).unwrap();
        CommandContext::new(request, Arc::new(Reporter::new("a1")), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_flaky_fails_then_succeeds() {
        let handler: FlakyHandler = FlakyHandler::default();
        let params: serde_json::Value = serde_json::json!({"fail_times": 2});

        assert!(handler.run(ctx("flaky", params.clone())).await.is_err());
        assert!(handler.run(ctx("flaky", params.clone())).await.is_err());
        assert_eq!(handler.run(ctx("flaky", params)).await.unwrap(), b"ok".to_vec());
    }

    #[tokio::test]
    async fn test_count_streams_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        CountHandler.run(ctx("count", serde_json::json!({"count": 3})), tx).await.unwrap();

        let mut items: Vec<String> = Vec::new();
        while let Some(data) = rx.recv().await {
            items.push(String::from_utf8(data).unwrap());
        }
        assert_eq!(items, vec!["1".to_string(), "2".to_string(), "3".to_string()]);
    }

    #[tokio::test]
    async fn test_sleep_cancellation() {
        let context: CommandContext = ctx("sleep", serde_json::json!({"millis": 60_000}));
        let cancel: CancellationToken = context.cancel.clone();
        let run = tokio::spawn(async move { SleepHandler.run(context).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = run.await.unwrap();
        assert!(outcome.is_err());
        assert_eq!(outcome.unwrap_err().code.as_deref(), Some("cancelled"));
    }
}
