//  LIB.rs
//    by OrbitMesh contributors
//
//  Description:
//!   The `orbitmesh-drv` service is the central host of an OrbitMesh
//!   deployment: it owns the node registry, the job queue and all
//!   workflow orchestration, serves the node transport (gRPC) and the
//!   admin API (HTTP/JSON + SSE), and runs the background sweepers and
//!   the deployment profile engine.
//

#![recursion_limit = "512"]

// Declare the modules
pub mod api;
pub mod deploy;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod handler;
pub mod hub;
pub mod state;
