//  AGENTS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the node (agent) data model: identity, advertised
//!   capabilities, lifecycle status and the triggers that drive the node
//!   state machine. The guarded transition table itself lives in
//!   `orbitmesh-reg`; this module only defines the vocabulary.
//

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter, Result as FResult};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use enum_debug::EnumDebug;
use serde::{Deserialize, Serialize};


/***** ERRORS *****/
/// Errors that relate to parsing agent-related enums from strings.
#[derive(Debug)]
pub enum AgentParseError {
    /// Unknown agent status.
    UnknownStatus { raw: String },
}
impl Display for AgentParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use AgentParseError::*;
        match self {
            UnknownStatus { raw } => write!(f, "Unknown agent status '{raw}'"),
        }
    }
}
impl std::error::Error for AgentParseError {}





/***** AUXILLARY *****/
/// Defines the lifecycle states of a node.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// The record exists, but the node has not started initializing yet.
    Created,
    /// The node is setting itself up.
    Initializing,
    /// The node is connected and idle; eligible for work.
    Ready,
    /// The node is connected and executing at least one job.
    Running,
    /// The node is connected but paused; not eligible for work.
    Paused,
    /// The node is shutting down.
    Stopping,
    /// The node has shut down cleanly.
    Stopped,
    /// The node misbehaved (e.g., missed heartbeats).
    Faulted,
    /// The node's transport session is gone.
    Disconnected,
}
impl AgentStatus {
    /// Returns whether a node in this status may be handed work.
    #[inline]
    pub fn is_eligible(&self) -> bool { matches!(self, Self::Ready | Self::Running) }
}
impl Display for AgentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use AgentStatus::*;
        match self {
            Created => write!(f, "created"),
            Initializing => write!(f, "initializing"),
            Ready => write!(f, "ready"),
            Running => write!(f, "running"),
            Paused => write!(f, "paused"),
            Stopping => write!(f, "stopping"),
            Stopped => write!(f, "stopped"),
            Faulted => write!(f, "faulted"),
            Disconnected => write!(f, "disconnected"),
        }
    }
}
impl FromStr for AgentStatus {
    type Err = AgentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "initializing" => Ok(Self::Initializing),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "faulted" => Ok(Self::Faulted),
            "disconnected" => Ok(Self::Disconnected),

            raw => Err(AgentParseError::UnknownStatus { raw: raw.into() }),
        }
    }
}



/// Defines the triggers that drive the node state machine.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTrigger {
    /// Start setting the node up.
    Initialize,
    /// The node's transport session came up.
    Connect,
    /// The node picked up a job.
    StartJob,
    /// The node finished its last job.
    CompleteJob,
    /// Operator paused the node.
    Pause,
    /// Operator resumed the node.
    Resume,
    /// The node is asked to shut down.
    Stop,
    /// The node finished shutting down.
    Stopped,
    /// Something went wrong (e.g., missed heartbeats).
    Fault,
    /// Recover from a fault.
    Recover,
    /// The transport session dropped.
    Disconnect,
    /// A previously disconnected node is dialing back in.
    Reconnect,
}

/// Defines a single named capability a node advertises (e.g., `gpu`).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Capability {
    /// The capability's name; jobs require capabilities by name.
    pub name: String,
    /// Optional version of the capability implementation.
    #[serde(default)]
    pub version: Option<String>,
    /// Free-form capability attributes.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}
impl Capability {
    /// Creates a plain named capability without version or attributes.
    #[inline]
    pub fn named(name: impl Into<String>) -> Self { Self { name: name.into(), version: None, attributes: HashMap::new() } }
}





/***** LIBRARY *****/
/// Defines everything the host tracks about a node.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AgentInfo {
    /// Unique, stable identifier of the node.
    pub id: String,
    /// Human-readable name (defaults to the node's hostname).
    pub name: String,
    /// The capabilities this node advertises, keyed by name.
    #[serde(default)]
    pub capabilities: HashMap<String, Capability>,
    /// The group this node belongs to, if any.
    #[serde(default)]
    pub group: Option<String>,
    /// Free-form tags, conventionally `key:value`.
    #[serde(default)]
    pub tags: HashSet<String>,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Transport session handle; None exactly when the node is disconnected.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Timestamp of the last heartbeat received from this node.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Free-form metadata (e.g., a `weight` for the weighted routing policy).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
impl AgentInfo {
    /// Creates a fresh agent record in status `Created` with no connection.
    ///
    /// # Arguments
    /// - `id`: The node's unique identifier.
    /// - `name`: The node's human-readable name.
    ///
    /// # Returns
    /// A new AgentInfo instance.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: HashMap::new(),
            group: None,
            tags: HashSet::new(),
            status: AgentStatus::Created,
            connection_id: None,
            last_heartbeat: None,
            metadata: HashMap::new(),
        }
    }

    /// Returns whether this node's capability set covers the given required set.
    ///
    /// # Arguments
    /// - `required`: The names of the required capabilities.
    ///
    /// # Returns
    /// True if every required capability is advertised by this node.
    #[inline]
    pub fn covers(&self, required: &HashSet<String>) -> bool { required.iter().all(|cap| self.capabilities.contains_key(cap)) }

    /// Returns whether this node carries all of the given tags.
    #[inline]
    pub fn carries(&self, required: &HashSet<String>) -> bool { required.iter().all(|tag| self.tags.contains(tag)) }

    /// Reads the routing weight from the metadata, defaulting to 1.
    #[inline]
    pub fn weight(&self) -> u32 { self.metadata.get("weight").and_then(|raw| raw.parse::<u32>().ok()).unwrap_or(1).max(1) }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_and_carries() {
        let mut agent: AgentInfo = AgentInfo::new("a1", "node-1");
        agent.capabilities.insert("shell".into(), Capability::named("shell"));
        agent.capabilities.insert("gpu".into(), Capability::named("gpu"));
        agent.tags.insert("region:eu".into());

        assert!(agent.covers(&HashSet::new()));
        assert!(agent.covers(&HashSet::from(["shell".to_string()])));
        assert!(agent.covers(&HashSet::from(["shell".to_string(), "gpu".to_string()])));
        assert!(!agent.covers(&HashSet::from(["fs".to_string()])));

        assert!(agent.carries(&HashSet::from(["region:eu".to_string()])));
        assert!(!agent.carries(&HashSet::from(["region:us".to_string()])));
    }

    #[test]
    fn test_eligibility() {
        use AgentStatus::*;
        for status in [Ready, Running] {
            assert!(status.is_eligible());
        }
        for status in [Created, Initializing, Paused, Stopping, Stopped, Faulted, Disconnected] {
            assert!(!status.is_eligible());
        }
    }

    #[test]
    fn test_weight_defaults() {
        let mut agent: AgentInfo = AgentInfo::new("a1", "node-1");
        assert_eq!(agent.weight(), 1);
        agent.metadata.insert("weight".into(), "5".into());
        assert_eq!(agent.weight(), 5);
        agent.metadata.insert("weight".into(), "garbage".into());
        assert_eq!(agent.weight(), 1);
        agent.metadata.insert("weight".into(), "0".into());
        assert_eq!(agent.weight(), 1);
    }

    #[test]
    fn test_status_string_roundtrip() {
        use AgentStatus::*;
        for status in [Created, Initializing, Ready, Running, Paused, Stopping, Stopped, Faulted, Disconnected] {
            assert_eq!(AgentStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }
}
