//  CONNECTION.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the agent's connection loop: dial the host, register,
//!   attach to the command stream and pump it into the router; on any
//!   failure, back off exponentially and dial again. Reports parked
//!   while offline replay in order once the session is back.
//

use std::sync::Arc;
use std::time::Duration;

use error_trace::ErrorTrace as _;
use log::{debug, error, info, warn};
use specifications::agents::AgentInfo;
use specifications::reporting::{AgentDescriptor, AttachRequest, RegisterReply, RegisterRequest, ReportingServiceClient, UnregisterRequest};
use tokio::sync::watch;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::dispatch::CommandRouter;
use crate::reporter::Reporter;


/***** CONSTANTS *****/
/// The initial reconnect backoff.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// The reconnect backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// The heartbeat interval used until the host recommends one.
const HEARTBEAT_FALLBACK: Duration = Duration::from_secs(30);





/***** AUXILLARY *****/
/// Everything the connection loop needs to present this agent to the host.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// The host's gRPC endpoint as a connectable URL.
    pub server_url: String,
    /// The agent's self-description.
    pub agent: AgentInfo,
    /// A pre-issued access token, if the agent holds one.
    pub access_token: Option<String>,
    /// The bootstrap-token secret for first contact, if configured.
    pub bootstrap_token: Option<String>,
}

/// Sleeps for the given duration, or returns early when shutdown is signalled.
///
/// # Returns
/// True if shutdown was signalled.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}





/***** LIBRARY *****/
/// Runs the agent's connection loop until shutdown is signalled.
///
/// # Arguments
/// - `config`: How to reach and present to the host.
/// - `reporter`: The outbound reporting path (its queue survives reconnects).
/// - `router`: The command router fed from the host's stream.
/// - `shutdown`: Raised by SIGTERM or a host-issued shutdown command.
///
/// # Returns
/// The process exit code: 0 for a clean shutdown.
pub async fn run(config: SessionConfig, reporter: Arc<Reporter>, router: Arc<CommandRouter>, mut shutdown: watch::Receiver<bool>) -> i32 {
    let agent_id: String = config.agent.id.clone();
    let mut backoff: Duration = BACKOFF_INITIAL;

    loop {
        if *shutdown.borrow() {
            return 0;
        }

        // Dial the host
        debug!("Dialing host at '{}'...", config.server_url);
        let mut client: ReportingServiceClient = match ReportingServiceClient::connect(config.server_url.clone()).await {
            Ok(client) => client,
            Err(err) => {
                warn!("{}", err.trace());
                if sleep_or_shutdown(backoff, &mut shutdown).await {
                    return 0;
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            },
        };

        // Register
        let request: RegisterRequest = RegisterRequest {
            agent: AgentDescriptor::from(&config.agent),
            bootstrap_token: config.bootstrap_token.clone(),
            access_token: config.access_token.clone(),
        };
        let reply: RegisterReply = match client.register(request).await {
            Ok(reply) => reply.into_inner(),
            Err(err) => {
                warn!("Registration call failed: {err}");
                if sleep_or_shutdown(backoff, &mut shutdown).await {
                    return 0;
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            },
        };
        if !reply.success {
            // Pending approval and outright denial both land here; keep knocking slowly
            warn!("Host did not accept registration: {}", reply.error.as_deref().unwrap_or("no reason given"));
            if sleep_or_shutdown(BACKOFF_MAX, &mut shutdown).await {
                return 0;
            }
            continue;
        }
        let heartbeat_interval: Duration = match reply.recommended_heartbeat_interval() {
            interval if interval.is_zero() => HEARTBEAT_FALLBACK,
            interval => interval,
        };
        info!("Registered with host (heartbeat every {heartbeat_interval:?})");
        backoff = BACKOFF_INITIAL;

        // Attach to the command stream
        let mut stream = match client.attach(AttachRequest { agent_id: agent_id.clone() }).await {
            Ok(stream) => stream.into_inner(),
            Err(err) => {
                warn!("Attach call failed: {err}");
                if sleep_or_shutdown(backoff, &mut shutdown).await {
                    return 0;
                }
                continue;
            },
        };

        // The session is up: replay parked reports, start heartbeating
        reporter.set_client(client.clone()).await;
        reporter.state("ready").await;
        let session: CancellationToken = CancellationToken::new();
        {
            let mut heartbeat_client: ReportingServiceClient = client.clone();
            let heartbeat_agent: String = agent_id.clone();
            let session: CancellationToken = session.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(heartbeat_interval) => {},
                        _ = session.cancelled() => break,
                    }
                    if let Err(err) = heartbeat_client.heartbeat(specifications::reporting::HeartbeatRequest { agent_id: heartbeat_agent.clone() }).await
                    {
                        debug!("Heartbeat failed: {err}");
                        break;
                    }
                }
            });
        }

        // Pump commands until the stream or the process ends
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(command)) => router.handle(command).await,
                    Some(Err(status)) => {
                        warn!("Command stream error: {status}");
                        break;
                    },
                    None => {
                        info!("Host closed the command stream");
                        break;
                    },
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutting down; unregistering from host");
                        session.cancel();
                        if let Err(err) = client.unregister(UnregisterRequest { agent_id: agent_id.clone() }).await {
                            error!("Failed to unregister cleanly: {err}");
                        }
                        return 0;
                    }
                },
            }
        }

        // The session is gone; park future reports and dial again
        session.cancel();
        reporter.clear_client();
        warn!("Session to host lost; reconnecting");
    }
}
