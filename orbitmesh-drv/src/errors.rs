//  ERRORS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Contains errors used within the `orbitmesh-drv` service only.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};
use std::path::PathBuf;


/***** LIBRARY *****/
/// Defines errors that relate to the connection hub.
#[derive(Debug)]
pub enum HubError {
    /// The agent has no live command channel.
    NotConnected { agent_id: String },
    /// The agent's command channel is full (it is not draining its stream).
    ChannelFull { agent_id: String },
}
impl Display for HubError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use HubError::*;
        match self {
            NotConnected { agent_id } => write!(f, "Agent '{agent_id}' has no live command channel"),
            ChannelFull { agent_id } => write!(f, "Command channel of agent '{agent_id}' is full"),
        }
    }
}
impl Error for HubError {}



/// Defines errors that relate to the deployment profile engine.
#[derive(Debug)]
pub enum DeployError {
    /// The referenced profile does not exist.
    UnknownProfile { id: String },
    /// The referenced execution does not exist.
    UnknownExecution { id: String },
    /// The profile's source path could not be scanned.
    ScanError { path: PathBuf, err: std::io::Error },
    /// The profile's source path escapes the configured root.
    OutsideRoot { path: PathBuf, root: PathBuf },
    /// The file-sync feature is disabled in the host config.
    FeatureDisabled,
}
impl Display for DeployError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use DeployError::*;
        match self {
            UnknownProfile { id } => write!(f, "Unknown deployment profile '{id}'"),
            UnknownExecution { id } => write!(f, "Unknown deployment execution '{id}'"),
            ScanError { path, .. } => write!(f, "Failed to scan source path '{}'", path.display()),
            OutsideRoot { path, root } => write!(f, "Source path '{}' escapes the configured root '{}'", path.display(), root.display()),
            FeatureDisabled => write!(f, "The file-sync feature is disabled on this host"),
        }
    }
}
impl Error for DeployError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use DeployError::*;
        match self {
            ScanError { err, .. } => Some(err),
            _ => None,
        }
    }
}
