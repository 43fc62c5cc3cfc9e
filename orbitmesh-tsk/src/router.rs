//  ROUTER.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the router: given a job's constraints it selects the node
//!   that should run it, honouring the preferred node, group, tag and
//!   capability constraints and the configured load-balancing policy.
//!   Ties always break on the smallest node id so selection is
//!   deterministic.
//

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use enum_debug::EnumDebug;
use orbitmesh_reg::registry::NodeRegistry;
use rand::Rng as _;
use specifications::agents::{AgentInfo, AgentStatus};
use specifications::jobs::Job;


/***** AUXILLARY *****/
/// The available load-balancing policies.
#[derive(Clone, Copy, Debug, EnumDebug, Eq, PartialEq)]
pub enum RoutePolicy {
    /// Cycle through the candidate list.
    RoundRobin,
    /// Pick the node with the fewest in-flight jobs.
    LeastConnections,
    /// Pick uniformly at random.
    Random,
    /// Pick proportionally to each node's metadata weight.
    Weighted,
}

/// The constraints a single routing decision works with.
#[derive(Clone, Debug, Default)]
pub struct RouteRequest {
    /// Capabilities the node must cover.
    pub required_capabilities: HashSet<String>,
    /// Tags the node must carry.
    pub required_tags: HashSet<String>,
    /// A node the caller would like to use, if it qualifies.
    pub preferred_agent_id: Option<String>,
    /// Restrict the candidate set to this group.
    pub target_group: Option<String>,
    /// Nodes that must not be picked (e.g., they already failed this job).
    pub excluded_agent_ids: HashSet<String>,
}
impl RouteRequest {
    /// Derives the routing constraints for the given job.
    ///
    /// The preferred node is the request's target; the group is read from the `target_group`
    /// metadata key; exclusions are the nodes that already failed the job.
    pub fn for_job(job: &Job) -> Self {
        Self {
            required_capabilities: job.request.required_capabilities.clone(),
            required_tags: job.request.required_tags.clone(),
            preferred_agent_id: job.request.target_agent_id.clone(),
            target_group: job.request.metadata.get("target_group").cloned(),
            excluded_agent_ids: job.excluded_agent_ids.clone(),
        }
    }
}





/***** LIBRARY *****/
/// Selects a node for each job, according to the configured policy.
#[derive(Debug)]
pub struct Router {
    /// The registry the candidate sets come from.
    registry: Arc<NodeRegistry>,
    /// The configured policy.
    policy: RoutePolicy,
    /// Round-robin cursor.
    cursor: AtomicUsize,
}
impl Router {
    /// Constructor for the Router.
    ///
    /// # Arguments
    /// - `registry`: The node registry to select from.
    /// - `policy`: The load-balancing policy to apply.
    #[inline]
    pub fn new(registry: Arc<NodeRegistry>, policy: RoutePolicy) -> Self { Self { registry, policy, cursor: AtomicUsize::new(0) } }

    /// Returns the configured policy.
    #[inline]
    pub fn policy(&self) -> RoutePolicy { self.policy }

    /// Selects a node for the given constraints.
    ///
    /// # Arguments
    /// - `request`: The constraints to satisfy.
    /// - `load`: Reports the number of in-flight jobs per node (used by `LeastConnections`).
    ///
    /// # Returns
    /// The selected node, or None if no eligible node matches (the caller leaves the job
    /// pending).
    pub fn select(&self, request: &RouteRequest, load: impl Fn(&str) -> usize) -> Option<AgentInfo> {
        // The preferred node short-circuits everything if it qualifies
        if let Some(preferred) = &request.preferred_agent_id {
            if !request.excluded_agent_ids.contains(preferred) {
                if let Some(agent) = self.registry.get(preferred) {
                    if agent.status == AgentStatus::Ready && agent.covers(&request.required_capabilities) && agent.carries(&request.required_tags) {
                        return Some(agent);
                    }
                }
            }
        }

        // Otherwise compute the candidate set and apply the policy
        let candidates: Vec<AgentInfo> = self.registry.candidates(
            request.target_group.as_deref(),
            &request.required_capabilities,
            &request.required_tags,
            &request.excluded_agent_ids,
        );
        self.pick(&candidates, load).cloned()
    }

    /// Applies the policy to an (id-sorted) candidate list.
    fn pick<'c>(&self, candidates: &'c [AgentInfo], load: impl Fn(&str) -> usize) -> Option<&'c AgentInfo> {
        if candidates.is_empty() {
            return None;
        }

        match self.policy {
            RoutePolicy::RoundRobin => {
                let idx: usize = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(&candidates[idx])
            },
            RoutePolicy::LeastConnections => {
                // The list is id-sorted, so min_by_key's first-wins behaviour is the tie-break
                candidates.iter().min_by_key(|agent| load(&agent.id))
            },
            RoutePolicy::Random => {
                let idx: usize = rand::thread_rng().gen_range(0..candidates.len());
                Some(&candidates[idx])
            },
            RoutePolicy::Weighted => {
                let total: u32 = candidates.iter().map(AgentInfo::weight).sum();
                let mut roll: u32 = rand::thread_rng().gen_range(0..total.max(1));
                for agent in candidates {
                    let weight: u32 = agent.weight();
                    if roll < weight {
                        return Some(agent);
                    }
                    roll -= weight;
                }
                candidates.last()
            },
        }
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use specifications::agents::Capability;

    use super::*;

    /// Builds a registry with three registered shell nodes.
    fn registry() -> Arc<NodeRegistry> {
        let registry: Arc<NodeRegistry> = Arc::new(NodeRegistry::new());
        for id in ["a1", "a2", "a3"] {
            let mut agent: AgentInfo = AgentInfo::new(id, format!("node-{id}"));
            agent.capabilities.insert("shell".into(), Capability::named("shell"));
            registry.register(agent, format!("conn-{id}"));
        }
        registry
    }

    #[test]
    fn test_round_robin_is_deterministic() {
        let router: Router = Router::new(registry(), RoutePolicy::RoundRobin);
        let request: RouteRequest = RouteRequest { required_capabilities: HashSet::from(["shell".to_string()]), ..Default::default() };

        let picks: Vec<String> = (0..6).map(|_| router.select(&request, |_| 0).unwrap().id).collect();
        assert_eq!(picks, vec!["a1", "a2", "a3", "a1", "a2", "a3"]);
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let router: Router = Router::new(registry(), RoutePolicy::LeastConnections);
        let request: RouteRequest = RouteRequest::default();

        let picked: AgentInfo = router.select(&request, |id| match id {
            "a1" => 3,
            "a2" => 1,
            _ => 2,
        })
        .unwrap();
        assert_eq!(picked.id, "a2");

        // On a tie, the smallest id wins
        let picked: AgentInfo = router.select(&request, |_| 1).unwrap();
        assert_eq!(picked.id, "a1");
    }

    #[test]
    fn test_preferred_agent_short_circuits() {
        let router: Router = Router::new(registry(), RoutePolicy::RoundRobin);
        let request: RouteRequest = RouteRequest { preferred_agent_id: Some("a2".into()), ..Default::default() };
        assert_eq!(router.select(&request, |_| 0).unwrap().id, "a2");

        // An excluded preferred node falls back to the candidate set
        let request: RouteRequest = RouteRequest {
            preferred_agent_id: Some("a2".into()),
            excluded_agent_ids: HashSet::from(["a2".to_string()]),
            ..Default::default()
        };
        assert_ne!(router.select(&request, |_| 0).unwrap().id, "a2");
    }

    #[test]
    fn test_no_candidates_yields_none() {
        let router: Router = Router::new(registry(), RoutePolicy::RoundRobin);
        let request: RouteRequest = RouteRequest { required_capabilities: HashSet::from(["gpu".to_string()]), ..Default::default() };
        assert!(router.select(&request, |_| 0).is_none());
    }

    #[test]
    fn test_random_and_weighted_stay_in_candidate_set() {
        for policy in [RoutePolicy::Random, RoutePolicy::Weighted] {
            let router: Router = Router::new(registry(), policy);
            let request: RouteRequest = RouteRequest::default();
            for _ in 0..32 {
                let picked: AgentInfo = router.select(&request, |_| 0).unwrap();
                assert!(["a1", "a2", "a3"].contains(&picked.id.as_str()));
            }
        }
    }
}
