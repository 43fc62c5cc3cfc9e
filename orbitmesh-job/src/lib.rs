//  LIB.rs
//    by OrbitMesh contributors
//
//  Description:
//!   The `orbitmesh-job` service is the node-side agent of an OrbitMesh
//!   deployment: it dials the host, registers, attaches to the command
//!   stream and dispatches incoming jobs to its local handler registry,
//!   reporting acknowledgements, progress and results back — queueing
//!   them across disconnects.
//

// Declare the modules
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod registry;
pub mod reporter;
