//  REGISTRY.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the node registry: durable membership records with
//!   secondary capability/group/tag indexes, heartbeat tracking and the
//!   guarded lifecycle transitions. The indexes double as the transport's
//!   fan-out channels; the connection hub resolves channel names against
//!   them but never owns them.
//

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use specifications::agents::{AgentInfo, AgentStatus, AgentTrigger};
use tokio::sync::broadcast;

pub use crate::errors::RegistryError as Error;
use crate::lifecycle::{self, StateChange};


/***** CONSTANTS *****/
/// The capacity of the registry's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;





/***** AUXILLARY *****/
/// The events the registry publishes to interested observers (e.g., the dashboard feed).
#[derive(Clone, Debug)]
pub enum AgentEvent {
    /// A node (re-)registered.
    Registered { agent: AgentInfo },
    /// A node was unregistered or its session dropped.
    Disconnected { agent_id: String },
    /// A node's lifecycle state changed.
    StatusChanged(StateChange),
}

/// The secondary indexes over the membership records.
#[derive(Debug, Default)]
struct Indexes {
    /// Capability name -> member node ids.
    capabilities: HashMap<String, HashSet<String>>,
    /// Group name -> member node ids.
    groups: HashMap<String, HashSet<String>>,
    /// Tag -> member node ids.
    tags: HashMap<String, HashSet<String>>,
}
impl Indexes {
    /// Adds the given agent to all channels its record implies.
    fn join(&mut self, agent: &AgentInfo) {
        for cap in agent.capabilities.keys() {
            self.capabilities.entry(cap.clone()).or_default().insert(agent.id.clone());
        }
        if let Some(group) = &agent.group {
            self.groups.entry(group.clone()).or_default().insert(agent.id.clone());
        }
        for tag in &agent.tags {
            self.tags.entry(tag.clone()).or_default().insert(agent.id.clone());
        }
    }

    /// Removes the given agent from every channel, dropping emptied channels.
    fn leave(&mut self, agent_id: &str) {
        self.capabilities.retain(|_, members| {
            members.remove(agent_id);
            !members.is_empty()
        });
        self.groups.retain(|_, members| {
            members.remove(agent_id);
            !members.is_empty()
        });
        self.tags.retain(|_, members| {
            members.remove(agent_id);
            !members.is_empty()
        });
    }
}

/// The state behind the registry's lock.
#[derive(Debug, Default)]
struct RegistryInner {
    /// The membership records themselves.
    records: HashMap<String, AgentInfo>,
    /// The secondary indexes.
    indexes: Indexes,
}





/***** LIBRARY *****/
/// The host's node registry. All mutations are atomic with respect to the record/index
/// invariants; events are published after the lock is released.
#[derive(Debug)]
pub struct NodeRegistry {
    /// The records plus indexes, under one lock so compound updates stay consistent.
    inner: RwLock<RegistryInner>,
    /// The channel on which membership events are published.
    events: broadcast::Sender<AgentEvent>,
}

impl Default for NodeRegistry {
    #[inline]
    fn default() -> Self { Self::new() }
}
impl NodeRegistry {
    /// Constructor for the NodeRegistry.
    ///
    /// # Returns
    /// A new, empty NodeRegistry instance.
    #[inline]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { inner: RwLock::new(RegistryInner::default()), events }
    }

    /// Subscribes to membership events.
    #[inline]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> { self.events.subscribe() }

    /// Registers (or re-registers) a node.
    ///
    /// Any previous record with the same id is replaced. The node becomes `Ready`, carries the
    /// given connection id and joins its capability/group/tag channels.
    ///
    /// # Arguments
    /// - `agent`: The node's self-description.
    /// - `connection_id`: The transport session handle assigned to this registration.
    ///
    /// # Returns
    /// The record as stored.
    pub fn register(&self, mut agent: AgentInfo, connection_id: impl Into<String>) -> AgentInfo {
        let connection_id: String = connection_id.into();
        agent.status = AgentStatus::Ready;
        agent.connection_id = Some(connection_id);
        agent.last_heartbeat = Some(Utc::now());

        {
            let mut inner = self.inner.write();
            if inner.records.remove(&agent.id).is_some() {
                debug!("Replacing existing record for agent '{}'", agent.id);
                inner.indexes.leave(&agent.id);
            }
            inner.indexes.join(&agent);
            inner.records.insert(agent.id.clone(), agent.clone());
        }

        info!("Registered agent '{}' ({}) with {} capabilities", agent.id, agent.name, agent.capabilities.len());
        let _ = self.events.send(AgentEvent::Registered { agent: agent.clone() });
        agent
    }

    /// Applies a lifecycle trigger to the given node, guarded by the transition table.
    ///
    /// When the new state is `Disconnected`, the connection id is cleared and the node leaves
    /// its channels, upholding the `Disconnected <=> no connection` invariant.
    ///
    /// # Arguments
    /// - `agent_id`: The node to transition.
    /// - `trigger`: The trigger to apply.
    ///
    /// # Returns
    /// The emitted [`StateChange`].
    ///
    /// # Errors
    /// This function errors if the node is unknown or the trigger is illegal in its current
    /// state (in which case nothing changes).
    pub fn apply_trigger(&self, agent_id: &str, trigger: AgentTrigger) -> Result<StateChange, Error> {
        let change: StateChange = {
            let mut inner = self.inner.write();
            let record: &mut AgentInfo = match inner.records.get_mut(agent_id) {
                Some(record) => record,
                None => {
                    return Err(Error::UnknownAgent { id: agent_id.into() });
                },
            };

            let old: AgentStatus = record.status;
            let new: AgentStatus = match lifecycle::transition(old, trigger) {
                Some(new) => new,
                None => {
                    return Err(Error::IllegalTransition { id: agent_id.into(), status: old, trigger });
                },
            };
            record.status = new;
            if new == AgentStatus::Disconnected {
                record.connection_id = None;
                inner.indexes.leave(agent_id);
            }

            StateChange { agent_id: agent_id.into(), old, new, trigger, at: Utc::now() }
        };

        debug!("Agent '{}' transitioned {:?} -> {:?} on {:?}", agent_id, change.old, change.new, change.trigger);
        let _ = self.events.send(AgentEvent::StatusChanged(change.clone()));
        Ok(change)
    }

    /// Marks a node's session as gone (explicit unregister or connection loss).
    ///
    /// The record is retained for audit; only the connection id and channel memberships go.
    ///
    /// # Arguments
    /// - `agent_id`: The node whose session dropped.
    ///
    /// # Errors
    /// This function errors if the node is unknown. An already disconnected node is a no-op.
    pub fn mark_disconnected(&self, agent_id: &str) -> Result<(), Error> {
        {
            let inner = self.inner.read();
            match inner.records.get(agent_id) {
                Some(record) if record.status == AgentStatus::Disconnected => return Ok(()),
                Some(_) => {},
                None => {
                    return Err(Error::UnknownAgent { id: agent_id.into() });
                },
            }
        }

        self.apply_trigger(agent_id, AgentTrigger::Disconnect)?;
        let _ = self.events.send(AgentEvent::Disconnected { agent_id: agent_id.into() });
        Ok(())
    }

    /// Records a heartbeat for the given node. The timestamp only ever moves forward.
    ///
    /// # Errors
    /// This function errors if the node is unknown.
    pub fn heartbeat(&self, agent_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let record: &mut AgentInfo = match inner.records.get_mut(agent_id) {
            Some(record) => record,
            None => {
                return Err(Error::UnknownAgent { id: agent_id.into() });
            },
        };

        let now: DateTime<Utc> = Utc::now();
        if record.last_heartbeat.map(|last| last < now).unwrap_or(true) {
            record.last_heartbeat = Some(now);
        }
        Ok(())
    }

    /// Returns a clone of the given node's record.
    #[inline]
    pub fn get(&self, agent_id: &str) -> Option<AgentInfo> { self.inner.read().records.get(agent_id).cloned() }

    /// Returns clones of all records, connected or not.
    #[inline]
    pub fn list(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.inner.read().records.values().cloned().collect();
        agents.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        agents
    }

    /// Returns all nodes that are currently eligible for work (`Ready` or `Running`).
    #[inline]
    pub fn eligible(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.inner.read().records.values().filter(|agent| agent.status.is_eligible()).cloned().collect();
        agents.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        agents
    }

    /// Looks up the eligible nodes whose capability set covers the given required set.
    ///
    /// # Arguments
    /// - `required`: The capability names that must all be advertised.
    ///
    /// # Returns
    /// The matching nodes, sorted by id for determinism.
    pub fn lookup_by_capabilities(&self, required: &HashSet<String>) -> Vec<AgentInfo> {
        let inner = self.inner.read();

        // Start from the smallest index set to keep the scan cheap
        let mut agents: Vec<AgentInfo> = match required.iter().next() {
            Some(first) => {
                let seed: HashSet<String> = match inner.indexes.capabilities.get(first) {
                    Some(members) => members.clone(),
                    None => return Vec::new(),
                };
                seed.iter().filter_map(|id| inner.records.get(id)).filter(|agent| agent.status.is_eligible() && agent.covers(required)).cloned().collect()
            },
            None => inner.records.values().filter(|agent| agent.status.is_eligible()).cloned().collect(),
        };
        agents.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        agents
    }

    /// Computes the router's candidate set: group, capability and tag constraints intersected,
    /// exclusions removed, filtered to eligible nodes.
    ///
    /// # Arguments
    /// - `group`: When set, only members of this group are considered.
    /// - `capabilities`: Capabilities the node must cover.
    /// - `tags`: Tags the node must carry.
    /// - `excluded`: Node ids that must not be returned.
    ///
    /// # Returns
    /// The matching nodes, sorted by id for determinism.
    pub fn candidates(
        &self,
        group: Option<&str>,
        capabilities: &HashSet<String>,
        tags: &HashSet<String>,
        excluded: &HashSet<String>,
    ) -> Vec<AgentInfo> {
        let inner = self.inner.read();
        let mut agents: Vec<AgentInfo> = inner
            .records
            .values()
            .filter(|agent| agent.status.is_eligible())
            .filter(|agent| !excluded.contains(&agent.id))
            .filter(|agent| group.map(|group| agent.group.as_deref() == Some(group)).unwrap_or(true))
            .filter(|agent| agent.covers(capabilities) && agent.carries(tags))
            .cloned()
            .collect();
        agents.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        agents
    }

    /// Returns the member ids of the given named channel, for transport fan-out.
    ///
    /// # Arguments
    /// - `kind`: Which index to consult (`"capability"`, `"group"` or `"tag"`).
    /// - `name`: The channel name within that index.
    pub fn channel_members(&self, kind: ChannelKind, name: &str) -> HashSet<String> {
        let inner = self.inner.read();
        let index: &HashMap<String, HashSet<String>> = match kind {
            ChannelKind::Capability => &inner.indexes.capabilities,
            ChannelKind::Group => &inner.indexes.groups,
            ChannelKind::Tag => &inner.indexes.tags,
        };
        index.get(name).cloned().unwrap_or_default()
    }

    /// Finds nodes that went silent: connected nodes whose last heartbeat is older than the
    /// threshold are faulted.
    ///
    /// # Arguments
    /// - `threshold`: The maximum tolerated heartbeat age.
    ///
    /// # Returns
    /// The ids of the nodes that were just declared faulted; the caller is expected to tear
    /// their channels down (which transitions them to `Disconnected`).
    pub fn sweep_heartbeats(&self, threshold: std::time::Duration) -> Vec<String> {
        let now: DateTime<Utc> = Utc::now();
        let threshold: chrono::Duration = chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::max_value());

        // Collect the silent ones under a read lock first
        let silent: Vec<String> = {
            let inner = self.inner.read();
            inner
                .records
                .values()
                .filter(|agent| !matches!(agent.status, AgentStatus::Disconnected | AgentStatus::Stopped | AgentStatus::Faulted))
                .filter(|agent| agent.last_heartbeat.map(|last| now - last > threshold).unwrap_or(true))
                .map(|agent| agent.id.clone())
                .collect()
        };

        // Then fault them one by one (each under the write lock)
        let mut faulted: Vec<String> = Vec::with_capacity(silent.len());
        for agent_id in silent {
            match self.apply_trigger(&agent_id, AgentTrigger::Fault) {
                Ok(_) => {
                    warn!("Agent '{agent_id}' missed its heartbeat threshold; declared faulted");
                    faulted.push(agent_id);
                },
                // Somebody else transitioned it in the meantime; leave it be
                Err(Error::IllegalTransition { .. }) => continue,
                Err(Error::UnknownAgent { .. }) => continue,
            }
        }
        faulted
    }
}



/// Names the three kinds of fan-out channels the registry indexes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChannelKind {
    /// A capability channel (all nodes advertising a capability).
    Capability,
    /// A group channel.
    Group,
    /// A tag channel.
    Tag,
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use specifications::agents::Capability;

    use super::*;

    /// Builds a test agent with the given id and capabilities.
    fn agent(id: &str, caps: &[&str]) -> AgentInfo {
        let mut agent: AgentInfo = AgentInfo::new(id, format!("node-{id}"));
        for cap in caps {
            agent.capabilities.insert((*cap).into(), Capability::named(*cap));
        }
        agent
    }

    #[test]
    fn test_register_sets_ready_and_connection() {
        let registry: NodeRegistry = NodeRegistry::new();
        let stored: AgentInfo = registry.register(agent("a1", &["shell"]), "conn-1");
        assert_eq!(stored.status, AgentStatus::Ready);
        assert_eq!(stored.connection_id.as_deref(), Some("conn-1"));
        assert!(stored.last_heartbeat.is_some());

        // Re-registration replaces the record
        let stored: AgentInfo = registry.register(agent("a1", &["gpu"]), "conn-2");
        assert_eq!(stored.connection_id.as_deref(), Some("conn-2"));
        let fetched: AgentInfo = registry.get("a1").unwrap();
        assert!(fetched.capabilities.contains_key("gpu"));
        assert!(!fetched.capabilities.contains_key("shell"));
        assert!(registry.channel_members(ChannelKind::Capability, "shell").is_empty());
    }

    #[test]
    fn test_disconnect_clears_connection_but_keeps_record() {
        let registry: NodeRegistry = NodeRegistry::new();
        registry.register(agent("a1", &["shell"]), "conn-1");
        registry.mark_disconnected("a1").unwrap();

        let fetched: AgentInfo = registry.get("a1").unwrap();
        assert_eq!(fetched.status, AgentStatus::Disconnected);
        assert!(fetched.connection_id.is_none());
        assert!(registry.channel_members(ChannelKind::Capability, "shell").is_empty());

        // Second disconnect is a no-op
        registry.mark_disconnected("a1").unwrap();
    }

    #[test]
    fn test_illegal_trigger_changes_nothing() {
        let registry: NodeRegistry = NodeRegistry::new();
        registry.register(agent("a1", &[]), "conn-1");
        assert!(matches!(registry.apply_trigger("a1", AgentTrigger::Resume), Err(Error::IllegalTransition { .. })));
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Ready);
        assert!(matches!(registry.apply_trigger("ghost", AgentTrigger::Pause), Err(Error::UnknownAgent { .. })));
    }

    #[test]
    fn test_capability_lookup_filters_status_and_coverage() {
        let registry: NodeRegistry = NodeRegistry::new();
        registry.register(agent("a1", &["shell", "gpu"]), "c1");
        registry.register(agent("a2", &["shell"]), "c2");
        registry.register(agent("a3", &["gpu"]), "c3");
        registry.apply_trigger("a3", AgentTrigger::Pause).unwrap();

        let required: HashSet<String> = HashSet::from(["gpu".to_string()]);
        let found: Vec<AgentInfo> = registry.lookup_by_capabilities(&required);
        // a3 is paused and a2 lacks gpu
        assert_eq!(found.iter().map(|a| a.id.as_str()).collect::<Vec<&str>>(), vec!["a1"]);

        let required: HashSet<String> = HashSet::from(["shell".to_string()]);
        let found: Vec<AgentInfo> = registry.lookup_by_capabilities(&required);
        assert_eq!(found.iter().map(|a| a.id.as_str()).collect::<Vec<&str>>(), vec!["a1", "a2"]);
    }

    #[test]
    fn test_candidates_intersect_constraints() {
        let registry: NodeRegistry = NodeRegistry::new();
        let mut a1: AgentInfo = agent("a1", &["shell"]);
        a1.group = Some("builders".into());
        a1.tags.insert("region:eu".into());
        let mut a2: AgentInfo = agent("a2", &["shell"]);
        a2.group = Some("builders".into());
        registry.register(a1, "c1");
        registry.register(a2, "c2");

        let caps: HashSet<String> = HashSet::from(["shell".to_string()]);
        let tags: HashSet<String> = HashSet::from(["region:eu".to_string()]);
        let found: Vec<AgentInfo> = registry.candidates(Some("builders"), &caps, &tags, &HashSet::new());
        assert_eq!(found.iter().map(|a| a.id.as_str()).collect::<Vec<&str>>(), vec!["a1"]);

        // Exclusion removes the last candidate
        let excluded: HashSet<String> = HashSet::from(["a1".to_string()]);
        assert!(registry.candidates(Some("builders"), &caps, &tags, &excluded).is_empty());
    }

    #[test]
    fn test_heartbeat_sweep_faults_silent_agents() {
        let registry: NodeRegistry = NodeRegistry::new();
        registry.register(agent("a1", &[]), "c1");

        // A generous threshold keeps the agent alive
        assert!(registry.sweep_heartbeats(std::time::Duration::from_secs(3600)).is_empty());
        // A zero threshold faults it
        let faulted: Vec<String> = registry.sweep_heartbeats(std::time::Duration::ZERO);
        assert_eq!(faulted, vec!["a1".to_string()]);
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Faulted);
        // Channel teardown then disconnects it
        registry.apply_trigger("a1", AgentTrigger::Disconnect).unwrap();
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Disconnected);
        assert!(registry.get("a1").unwrap().connection_id.is_none());
    }
}
