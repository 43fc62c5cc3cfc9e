//  ERRORS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the errors that may occur in the `orbitmesh-reg` crate.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};

use specifications::agents::{AgentStatus, AgentTrigger};


/***** LIBRARY *****/
/// Defines errors that relate to the node registry.
#[derive(Debug)]
pub enum RegistryError {
    /// The referenced agent does not exist.
    UnknownAgent { id: String },
    /// The trigger is not allowed in the agent's current state.
    IllegalTransition { id: String, status: AgentStatus, trigger: AgentTrigger },
}
impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use RegistryError::*;
        match self {
            UnknownAgent { id } => write!(f, "Unknown agent '{id}'"),
            IllegalTransition { id, status, trigger } => {
                write!(f, "Trigger '{trigger:?}' is not allowed for agent '{id}' in state '{status}'")
            },
        }
    }
}
impl Error for RegistryError {}



/// Defines errors that relate to enrollment.
#[derive(Debug)]
pub enum EnrollError {
    /// The referenced enrollment does not exist.
    UnknownEnrollment { id: String },
    /// The enrollment is not in a state that allows the requested decision.
    IllegalDecision { id: String, status: crate::enroll::EnrollmentStatus },
}
impl Display for EnrollError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use EnrollError::*;
        match self {
            UnknownEnrollment { id } => write!(f, "Unknown enrollment '{id}'"),
            IllegalDecision { id, status } => write!(f, "Enrollment '{id}' is in state '{status:?}' and cannot be decided"),
        }
    }
}
impl Error for EnrollError {}
