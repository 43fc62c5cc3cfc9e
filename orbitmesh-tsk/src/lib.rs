//  LIB.rs
//    by OrbitMesh contributors
//
//  Description:
//!   The `orbitmesh-tsk` crate implements the host's job stack: the job
//!   repository with its idempotency index, the priority queue, the job
//!   manager (assignment, acknowledgement, completion, retry, timeout
//!   sweeping), the dead-letter store, the router that picks a node per
//!   job and the progress service.
//

// Declare the modules
pub mod deadletter;
pub mod errors;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod repository;
pub mod router;
pub mod spec;
