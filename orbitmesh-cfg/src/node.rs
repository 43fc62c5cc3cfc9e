//  NODE.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the layout of the `node.yml` file that configures an
//!   OrbitMesh process. The same file format serves both binaries; the
//!   `node`-field decides whether it configures the central host or a
//!   node agent.
//

use std::collections::HashSet;
use std::fmt::{Display, Formatter, Result as FResult};
use std::net::SocketAddr;
use std::path::PathBuf;

use enum_debug::EnumDebug;
use serde::{Deserialize, Serialize};
use specifications::address::Address;

pub use crate::errors::NodeConfigError as Error;
use crate::errors::TagParseError;
use crate::info::YamlInfo;
use crate::interval::Interval;


/***** CONSTANTS *****/
/// The environment variable that overrides the host's admin password.
pub const ADMIN_PASSWORD_ENV: &str = "ORBITMESH_ADMIN_PASSWORD";





/***** HELPER FUNCTIONS *****/
/// Provides the default gRPC bind address for the host.
#[inline]
fn default_bind_grpc() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 50051)) }
/// Provides the default HTTP bind address for the host.
#[inline]
fn default_bind_http() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }
/// Provides the default heartbeat interval.
#[inline]
fn default_heartbeat_interval() -> Interval { Interval::from_secs(30) }
/// Provides the default number of heartbeats a node may miss before it is declared faulted.
#[inline]
fn default_missed_heartbeats() -> u32 { 3 }
/// Provides the default deadline for a node to acknowledge an assigned job.
#[inline]
fn default_ack_deadline() -> Interval { Interval::from_secs(30) }
/// Provides the default interval of the host's sweepers.
#[inline]
fn default_sweep_interval() -> Interval { Interval::from_secs(2) }
/// Provides the default health monitor interval.
#[inline]
fn default_health_interval() -> Interval { Interval::from_secs(60) }
/// Provides the default `true` for serde.
#[inline]
fn default_true() -> bool { true }





/***** AUXILLARY *****/
/// Defines the possible node types.
#[derive(Clone, Copy, Debug, EnumDebug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    /// The central host, which owns the queue and does all the orchestration.
    Host,
    /// A node agent, which executes commands on a remote machine.
    Agent,
}
impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use NodeKind::*;
        match self {
            Host => write!(f, "host"),
            Agent => write!(f, "agent"),
        }
    }
}



/// Parses a comma-separated list of `key:value` tags, as given on the command line or in the
/// `ORBITMESH_TAGS` environment variable.
///
/// # Arguments
/// - `raw`: The raw, comma-separated string.
///
/// # Returns
/// The set of parsed tags. Empty segments are skipped.
///
/// # Errors
/// This function errors if any segment is not of the `key:value` shape.
pub fn parse_tags(raw: &str) -> Result<HashSet<String>, TagParseError> {
    let mut tags: HashSet<String> = HashSet::new();
    for part in raw.split(',') {
        let part: &str = part.trim();
        if part.is_empty() {
            continue;
        }

        // Validate the shape before accepting
        match part.split_once(':') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                tags.insert(part.into());
            },
            Some(_) => {
                return Err(TagParseError::EmptyPart { raw: part.into() });
            },
            None => {
                return Err(TagParseError::MissingColon { raw: part.into() });
            },
        }
    }
    Ok(tags)
}





/***** LIBRARY *****/
/// Defines the toplevel `node.yml` layout.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Any node-specific config
    pub node: NodeSpecificConfig,
}
impl<'de> YamlInfo<'de> for NodeConfig {}



/// Defines the flavour-specific part of the `node.yml` file.
#[derive(Clone, Debug, Deserialize, EnumDebug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSpecificConfig {
    /// Configuration for the central host.
    #[serde(alias = "central")]
    Host(HostConfig),
    /// Configuration for a node agent.
    #[serde(alias = "worker")]
    Agent(AgentConfig),
}
impl NodeSpecificConfig {
    /// Returns the kind of this config.
    #[inline]
    pub fn kind(&self) -> NodeKind {
        use NodeSpecificConfig::*;
        match self {
            Host(_) => NodeKind::Host,
            Agent(_) => NodeKind::Agent,
        }
    }

    /// Returns the internal host-specific configuration, or an error if this was an agent config.
    ///
    /// # Errors
    /// This function errors if we were not a `NodeSpecificConfig::Host`.
    #[inline]
    pub fn try_into_host(self) -> Result<HostConfig, Error> {
        match self {
            Self::Host(config) => Ok(config),
            other => Err(Error::WrongKind { got: other.kind().to_string(), expected: NodeKind::Host.to_string() }),
        }
    }

    /// Returns the internal agent-specific configuration, or an error if this was a host config.
    ///
    /// # Errors
    /// This function errors if we were not a `NodeSpecificConfig::Agent`.
    #[inline]
    pub fn try_into_agent(self) -> Result<AgentConfig, Error> {
        match self {
            Self::Agent(config) => Ok(config),
            other => Err(Error::WrongKind { got: other.kind().to_string(), expected: NodeKind::Agent.to_string() }),
        }
    }
}



/// Defines the configuration of the central host.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HostConfig {
    /// Where the gRPC (node transport) server binds.
    #[serde(default = "default_bind_grpc")]
    pub bind_grpc: SocketAddr,
    /// Where the HTTP (admin/JSON) server binds.
    #[serde(default = "default_bind_http")]
    pub bind_http: SocketAddr,

    /// The admin password protecting the HTTP API. Overridden by `ORBITMESH_ADMIN_PASSWORD`.
    #[serde(default)]
    pub admin_password: Option<String>,

    /// The heartbeat interval recommended to nodes.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: Interval,
    /// How many heartbeats a node may miss before it is declared faulted.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    /// How long an assigned job may go unacknowledged before it is requeued.
    #[serde(default = "default_ack_deadline")]
    pub ack_deadline: Interval,
    /// The interval of the host's background sweepers.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: Interval,

    /// Optional feature toggles.
    #[serde(default)]
    pub features: FeaturesConfig,
}
impl HostConfig {
    /// Resolves the effective admin password: the `ORBITMESH_ADMIN_PASSWORD` environment
    /// variable, or else the configured value.
    ///
    /// # Returns
    /// The password, or None if the API is to run unprotected.
    #[inline]
    pub fn admin_password(&self) -> Option<String> { std::env::var(ADMIN_PASSWORD_ENV).ok().or_else(|| self.admin_password.clone()) }

    /// Computes the threshold after which a silent node is declared faulted.
    #[inline]
    pub fn missed_heartbeat_threshold(&self) -> std::time::Duration { self.heartbeat_interval.duration() * self.missed_heartbeats.max(1) }
}

/// Defines the host's feature toggles.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FeaturesConfig {
    /// The deployment profile / file sync feature.
    #[serde(default)]
    pub file_sync: FileSyncConfig,
    /// The node health monitor.
    #[serde(default)]
    pub health_monitor: HealthMonitorConfig,
    /// Remote service management.
    #[serde(default)]
    pub service_management: ServiceManagementConfig,
}

/// Defines the file sync feature config.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FileSyncConfig {
    /// Whether deployment profiles are enabled at all.
    #[serde(default)]
    pub enabled: bool,
    /// The root under which all profile source paths must live.
    #[serde(default)]
    pub root_path: Option<PathBuf>,
}

/// Defines the health monitor feature config.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HealthMonitorConfig {
    /// Whether the heartbeat sweeper runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often the heartbeat sweeper runs.
    #[serde(default = "default_health_interval")]
    pub interval: Interval,
}
impl Default for HealthMonitorConfig {
    #[inline]
    fn default() -> Self { Self { enabled: true, interval: default_health_interval() } }
}

/// Defines the service management feature config.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ServiceManagementConfig {
    /// Whether nodes may be asked to manage local services.
    #[serde(default)]
    pub enabled: bool,
}



/// Defines the configuration of a node agent.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AgentConfig {
    /// The address of the host's gRPC endpoint.
    pub server_address: Address,

    /// The stable id of this agent. Generated (and logged) when omitted.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// The human-readable name of this agent. Defaults to the machine's hostname.
    #[serde(default)]
    pub agent_name: Option<String>,

    /// A pre-issued access token for registration.
    #[serde(default)]
    pub access_token: Option<String>,
    /// A bootstrap-token secret for first contact, when no access token is held yet.
    #[serde(default)]
    pub bootstrap_token: Option<String>,

    /// The group this agent belongs to.
    #[serde(default)]
    pub group: Option<String>,
    /// The tags this agent carries (each `key:value`).
    #[serde(default)]
    pub tags: Vec<String>,
    /// The capability names this agent advertises.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Whether the shell-execution handler may be registered.
    #[serde(default)]
    pub enable_shell_execution: bool,
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use crate::info::Info as _;

    use super::*;

    #[test]
    fn test_parse_tags() {
        let tags: HashSet<String> = parse_tags("region:eu, role:builder,,").unwrap();
        assert_eq!(tags, HashSet::from(["region:eu".to_string(), "role:builder".to_string()]));

        assert!(matches!(parse_tags("no-colon"), Err(TagParseError::MissingColon { .. })));
        assert!(matches!(parse_tags("empty:"), Err(TagParseError::EmptyPart { .. })));
        assert!(matches!(parse_tags(":empty"), Err(TagParseError::EmptyPart { .. })));
        assert!(parse_tags("").unwrap().is_empty());
    }

    #[test]
    fn test_host_config_defaults() {
        let raw: &str = r#"
node:
  host:
    admin_password: hunter2
"#;
        let config: NodeConfig = NodeConfig::from_string(raw).unwrap();
        let host: HostConfig = config.node.try_into_host().unwrap();
        assert_eq!(host.admin_password.as_deref(), Some("hunter2"));
        assert_eq!(host.heartbeat_interval, Interval::from_secs(30));
        assert_eq!(host.missed_heartbeats, 3);
        assert_eq!(host.missed_heartbeat_threshold(), std::time::Duration::from_secs(90));
        assert!(host.features.health_monitor.enabled);
        assert!(!host.features.file_sync.enabled);
    }

    #[test]
    fn test_agent_config_parse() {
        let raw: &str = r#"
node:
  agent:
    server_address: orbitmesh.example.com:50051
    agent_name: build-7
    tags:
    - "region:eu"
    capabilities:
    - shell
    - fs
"#;
        let config: NodeConfig = NodeConfig::from_string(raw).unwrap();
        let agent: AgentConfig = config.node.try_into_agent().unwrap();
        assert_eq!(agent.server_address.to_string(), "orbitmesh.example.com:50051");
        assert_eq!(agent.agent_name.as_deref(), Some("build-7"));
        assert_eq!(agent.capabilities, vec!["shell".to_string(), "fs".to_string()]);
        assert!(!agent.enable_shell_execution);
    }

    #[test]
    fn test_wrong_kind_is_an_error() {
        let raw: &str = "node:\n  host: {}\n";
        let config: NodeConfig = NodeConfig::from_string(raw).unwrap();
        assert!(matches!(config.node.try_into_agent(), Err(Error::WrongKind { .. })));
    }
}
