//  ERRORS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Contains errors used within the `orbitmesh-job` agent only.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};


/***** LIBRARY *****/
/// Defines errors a command handler may report. The message and code end up on the
/// [`JobResult`](specifications::jobs::JobResult) that travels back to the host.
#[derive(Debug)]
pub struct HandlerError {
    /// The human-readable error.
    pub message: String,
    /// The machine-readable code, if the handler distinguishes failure kinds.
    pub code: Option<String>,
}
impl HandlerError {
    /// Creates a handler error with a message only.
    #[inline]
    pub fn new(message: impl Into<String>) -> Self { Self { message: message.into(), code: None } }

    /// Creates a handler error with a message and a code.
    #[inline]
    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self { Self { message: message.into(), code: Some(code.into()) } }
}
impl Display for HandlerError {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult { write!(f, "{}", self.message) }
}
impl Error for HandlerError {}
