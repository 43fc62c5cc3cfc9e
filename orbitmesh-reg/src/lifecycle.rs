//  LIFECYCLE.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the node lifecycle state machine: which trigger is
//!   allowed in which state, and the change event every transition
//!   emits. Illegal triggers are rejected with no state change.
//

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use specifications::agents::{AgentStatus, AgentTrigger};


/***** LIBRARY *****/
/// The event emitted by every successful transition.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StateChange {
    /// The agent that transitioned.
    pub agent_id: String,
    /// The state it came from.
    pub old: AgentStatus,
    /// The state it is in now.
    pub new: AgentStatus,
    /// The trigger that caused the transition.
    pub trigger: AgentTrigger,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}



/// Computes the target state for the given trigger in the given state.
///
/// # Arguments
/// - `current`: The state the node is currently in.
/// - `trigger`: The trigger being applied.
///
/// # Returns
/// The new state, or None if the trigger is not allowed in the current state.
pub fn transition(current: AgentStatus, trigger: AgentTrigger) -> Option<AgentStatus> {
    use AgentStatus::*;
    use AgentTrigger::*;
    match (current, trigger) {
        (Created, Initialize) => Some(Initializing),

        (Initializing, Connect) => Some(Ready),
        (Initializing, Fault) => Some(Faulted),
        (Initializing, Disconnect) => Some(Disconnected),

        (Ready, StartJob) => Some(Running),
        (Ready, Pause) => Some(Paused),
        (Ready, Stop) => Some(Stopping),
        (Ready, Disconnect) => Some(Disconnected),
        (Ready, Fault) => Some(Faulted),

        (Running, CompleteJob) => Some(Ready),
        (Running, Pause) => Some(Paused),
        (Running, Stop) => Some(Stopping),
        (Running, Disconnect) => Some(Disconnected),
        (Running, Fault) => Some(Faulted),

        (Paused, Resume) => Some(Ready),
        (Paused, Stop) => Some(Stopping),
        (Paused, Disconnect) => Some(Disconnected),
        (Paused, Fault) => Some(Faulted),

        (Stopping, AgentTrigger::Stopped) => Some(AgentStatus::Stopped),
        (Stopping, Disconnect) => Some(Disconnected),
        (Stopping, Fault) => Some(Faulted),

        (AgentStatus::Stopped, Initialize) => Some(Initializing),

        (Faulted, Recover) => Some(Initializing),
        (Faulted, Disconnect) => Some(Disconnected),

        (Disconnected, Reconnect) => Some(Initializing),
        (Disconnected, Connect) => Some(Ready),

        _ => None,
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        use AgentStatus::*;
        use AgentTrigger::*;

        let mut state: AgentStatus = Created;
        for (trigger, expected) in [(Initialize, Initializing), (Connect, Ready), (StartJob, Running), (CompleteJob, Ready), (Stop, Stopping)] {
            state = transition(state, trigger).unwrap();
            assert_eq!(state, expected);
        }
        assert_eq!(transition(state, AgentTrigger::Stopped), Some(AgentStatus::Stopped));
    }

    #[test]
    fn test_illegal_triggers_are_rejected() {
        use AgentStatus::*;
        use AgentTrigger::*;

        assert_eq!(transition(Created, Connect), None);
        assert_eq!(transition(Ready, Initialize), None);
        assert_eq!(transition(Ready, Resume), None);
        assert_eq!(transition(AgentStatus::Stopped, StartJob), None);
        assert_eq!(transition(Faulted, StartJob), None);
        assert_eq!(transition(Disconnected, Pause), None);
    }

    #[test]
    fn test_fault_and_recovery() {
        use AgentStatus::*;
        use AgentTrigger::*;

        // Every connected state may fault
        for state in [Initializing, Ready, Running, Paused, Stopping] {
            assert_eq!(transition(state, Fault), Some(Faulted));
        }
        // Faulted can recover (to Initializing) or be torn down
        assert_eq!(transition(Faulted, Recover), Some(Initializing));
        assert_eq!(transition(Faulted, Disconnect), Some(Disconnected));
        // Disconnected nodes come back through Reconnect or a fresh Connect
        assert_eq!(transition(Disconnected, Reconnect), Some(Initializing));
        assert_eq!(transition(Disconnected, Connect), Some(Ready));
    }
}
