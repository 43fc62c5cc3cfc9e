//  HUB.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the connection hub: the host's side of the per-node
//!   command streams. The hub owns ConnectionId -> sender mappings only;
//!   channel fan-out resolves names against the registry's indexes, so
//!   there is no shared ownership between hub and registry.
//

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::Stream;
use log::{debug, warn};
use orbitmesh_reg::registry::{ChannelKind, NodeRegistry};
use specifications::commanding::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

pub use crate::errors::HubError as Error;


/***** CONSTANTS *****/
/// The per-connection command buffer. A node that stops draining its stream hits this.
const COMMAND_BUFFER: usize = 64;





/***** AUXILLARY *****/
/// The hub's record of one live command stream.
#[derive(Debug)]
struct Connection {
    /// The transport session handle this stream belongs to.
    connection_id: String,
    /// Pushes commands onto the node's stream.
    tx: mpsc::Sender<Result<Command, Status>>,
}

/// The events the hub publishes when sessions come and go.
#[derive(Clone, Debug)]
pub enum HubEvent {
    /// A node attached its command stream.
    Attached { agent_id: String, connection_id: String },
    /// A node's command stream went away (client hangup or teardown).
    Detached { agent_id: String, connection_id: String },
}

/// The server-streaming body returned by `attach`: a plain receiver stream plus a guard that
/// reports the hangup when the client goes away and tonic drops the stream.
pub struct CommandStream {
    /// The command receiver.
    inner: ReceiverStream<Result<Command, Status>>,
    /// Reports the disconnect on drop.
    _guard: DisconnectGuard,
}
impl Stream for CommandStream {
    type Item = Result<Command, Status>;

    #[inline]
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> { Pin::new(&mut self.inner).poll_next(cx) }
}

/// Reports a stream teardown back to the hub when dropped.
struct DisconnectGuard {
    /// The hub to report to.
    hub: Arc<ConnectionHub>,
    /// The agent whose stream this guards.
    agent_id: String,
    /// The session the stream belongs to.
    connection_id: String,
}
impl Drop for DisconnectGuard {
    fn drop(&mut self) { self.hub.connection_closed(&self.agent_id, &self.connection_id); }
}





/***** LIBRARY *****/
/// The connection hub. Owns the live command streams; consulted by the dispatcher for every
/// outbound command.
#[derive(Debug)]
pub struct ConnectionHub {
    /// Live streams, keyed by agent id (at most one per agent).
    connections: DashMap<String, Connection>,
    /// The registry whose indexes resolve channel names.
    registry: Arc<NodeRegistry>,
    /// Session lifecycle events, consumed by the host's cleanup task.
    events: mpsc::UnboundedSender<HubEvent>,
}
impl ConnectionHub {
    /// Constructor for the ConnectionHub.
    ///
    /// # Arguments
    /// - `registry`: The registry used for channel fan-out.
    ///
    /// # Returns
    /// The hub plus the receiving end of its session lifecycle events.
    pub fn new(registry: Arc<NodeRegistry>) -> (Arc<Self>, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { connections: DashMap::new(), registry, events }), rx)
    }

    /// Attaches a command stream for the given agent/session pair.
    ///
    /// Any previous stream of the same agent is replaced (its guard will fire, but the stale
    /// connection id keeps the teardown from clobbering the new session).
    ///
    /// # Arguments
    /// - `self`: Must be called on an `Arc`, since the returned stream's guard keeps the hub
    ///   alive.
    /// - `agent_id`: The agent attaching.
    /// - `connection_id`: The session handle assigned at registration.
    ///
    /// # Returns
    /// The stream to hand to tonic.
    pub fn attach(self: &Arc<Self>, agent_id: impl Into<String>, connection_id: impl Into<String>) -> CommandStream {
        let agent_id: String = agent_id.into();
        let connection_id: String = connection_id.into();

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        self.connections.insert(agent_id.clone(), Connection { connection_id: connection_id.clone(), tx });
        debug!("Agent '{agent_id}' attached command stream (session '{connection_id}')");
        let _ = self.events.send(HubEvent::Attached { agent_id: agent_id.clone(), connection_id: connection_id.clone() });

        CommandStream { inner: ReceiverStream::new(rx), _guard: DisconnectGuard { hub: self.clone(), agent_id, connection_id } }
    }

    /// Reports a dropped stream. Only fires the detach event if the session is still the
    /// current one (a reconnect may have replaced it already).
    fn connection_closed(&self, agent_id: &str, connection_id: &str) {
        let current: bool = self.connections.get(agent_id).map(|conn| conn.connection_id == connection_id).unwrap_or(false);
        if current {
            self.connections.remove(agent_id);
            debug!("Agent '{agent_id}' command stream closed (session '{connection_id}')");
            let _ = self.events.send(HubEvent::Detached { agent_id: agent_id.into(), connection_id: connection_id.into() });
        }
    }

    /// Tears down the given agent's stream from the host side (fault sweeper, shutdown).
    pub fn close(&self, agent_id: &str) {
        if let Some((agent_id, connection)) = self.connections.remove(agent_id) {
            debug!("Closing command stream of agent '{agent_id}'");
            let _ = self.events.send(HubEvent::Detached { agent_id, connection_id: connection.connection_id });
            // Dropping the sender ends the node's stream
        }
    }

    /// Returns whether the given agent has a live stream.
    #[inline]
    pub fn is_connected(&self, agent_id: &str) -> bool { self.connections.contains_key(agent_id) }

    /// Sends a command to one agent.
    ///
    /// The send is synchronous: a missing or full channel errors immediately, so the caller
    /// can revert the job without waiting for any deadline.
    ///
    /// # Errors
    /// This function errors if the agent has no live stream or its buffer is full.
    pub fn send_to_agent(&self, agent_id: &str, command: Command) -> Result<(), Error> {
        let conn = self.connections.get(agent_id).ok_or_else(|| Error::NotConnected { agent_id: agent_id.into() })?;
        match conn.tx.try_send(Ok(command)) {
            Ok(_) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::ChannelFull { agent_id: agent_id.into() }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::NotConnected { agent_id: agent_id.into() }),
        }
    }

    /// Fans a command out to every member of a named channel (capability, group or tag),
    /// resolved against the registry's indexes.
    ///
    /// # Returns
    /// How many agents the command was delivered to; per-agent failures are logged.
    pub fn send_to_channel(&self, kind: ChannelKind, name: &str, command: Command) -> usize {
        let mut delivered: usize = 0;
        for agent_id in self.registry.channel_members(kind, name) {
            match self.send_to_agent(&agent_id, command.clone()) {
                Ok(_) => delivered += 1,
                Err(err) => warn!("Failed to fan command out to agent '{agent_id}': {err}"),
            }
        }
        delivered
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use specifications::agents::AgentInfo;
    use specifications::commanding::{CommandKind, Ping};
    use tokio_stream::StreamExt as _;

    use super::*;

    #[tokio::test]
    async fn test_attach_send_and_close() {
        let registry: Arc<NodeRegistry> = Arc::new(NodeRegistry::new());
        let (hub, mut events) = ConnectionHub::new(registry.clone());
        registry.register(AgentInfo::new("a1", "node-1"), "conn-1");

        let mut stream: CommandStream = hub.attach("a1", "conn-1");
        assert!(matches!(events.recv().await, Some(HubEvent::Attached { .. })));
        assert!(hub.is_connected("a1"));

        hub.send_to_agent("a1", Command::new(CommandKind::Ping(Ping { nonce: 7 }))).unwrap();
        let command: Command = stream.next().await.unwrap().unwrap();
        assert!(matches!(command.into_kind().unwrap(), CommandKind::Ping(Ping { nonce: 7 })));

        // Closing from the host side ends the stream and fires the detach event
        hub.close("a1");
        assert!(stream.next().await.is_none());
        assert!(matches!(events.recv().await, Some(HubEvent::Detached { .. })));
        assert!(matches!(hub.send_to_agent("a1", Command::new(CommandKind::Ping(Ping { nonce: 8 }))), Err(Error::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_client_hangup_fires_detach() {
        let registry: Arc<NodeRegistry> = Arc::new(NodeRegistry::new());
        let (hub, mut events) = ConnectionHub::new(registry);

        let stream: CommandStream = hub.attach("a1", "conn-1");
        let _ = events.recv().await;

        // Dropping the stream is what tonic does when the client goes away
        drop(stream);
        assert!(matches!(events.recv().await, Some(HubEvent::Detached { .. })));
        assert!(!hub.is_connected("a1"));
    }

    #[tokio::test]
    async fn test_reconnect_does_not_clobber_new_session() {
        let registry: Arc<NodeRegistry> = Arc::new(NodeRegistry::new());
        let (hub, mut events) = ConnectionHub::new(registry);

        let old: CommandStream = hub.attach("a1", "conn-1");
        let _new: CommandStream = hub.attach("a1", "conn-2");
        let _ = events.recv().await;
        let _ = events.recv().await;

        // The stale stream's guard fires, but the new session stays connected
        drop(old);
        assert!(hub.is_connected("a1"));
        hub.send_to_agent("a1", Command::new(CommandKind::Ping(Ping { nonce: 1 }))).unwrap();
    }
}
