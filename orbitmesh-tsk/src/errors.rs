//  ERRORS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the errors that may occur in the `orbitmesh-tsk` crate.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};

use specifications::jobs::JobStatus;


/***** LIBRARY *****/
/// Defines errors that relate to the job repository.
#[derive(Debug)]
pub enum RepositoryError {
    /// The backing store failed.
    Storage { what: String },
}
impl Display for RepositoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use RepositoryError::*;
        match self {
            Storage { what } => write!(f, "Job store failure: {what}"),
        }
    }
}
impl Error for RepositoryError {}



/// Defines errors that relate to the job manager.
#[derive(Debug)]
pub enum JobError {
    /// The referenced job does not exist.
    UnknownJob { id: String },
    /// The requested status change is not in the legal transition table.
    IllegalTransition { id: String, from: JobStatus, to: JobStatus },
    /// The underlying repository failed.
    Repository { err: RepositoryError },
    /// The referenced dead-letter entry does not exist.
    UnknownDeadLetter { id: String },
}
impl Display for JobError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use JobError::*;
        match self {
            UnknownJob { id } => write!(f, "Unknown job '{id}'"),
            IllegalTransition { id, from, to } => write!(f, "Job '{id}' cannot go from '{from}' to '{to}'"),
            Repository { .. } => write!(f, "Job repository failure"),
            UnknownDeadLetter { id } => write!(f, "Unknown dead-letter entry '{id}'"),
        }
    }
}
impl Error for JobError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use JobError::*;
        match self {
            UnknownJob { .. } => None,
            IllegalTransition { .. } => None,
            Repository { err } => Some(err),
            UnknownDeadLetter { .. } => None,
        }
    }
}
impl From<RepositoryError> for JobError {
    #[inline]
    fn from(err: RepositoryError) -> Self { Self::Repository { err } }
}
