//  LIB.rs
//    by OrbitMesh contributors
//
//  Description:
//!   The `specifications` crate defines the public contract of the OrbitMesh
//!   platform: the job and agent data model shared by the host and the
//!   nodes, plus both wire surfaces of the transport (host -> node
//!   `commanding`, node -> host `reporting`). Everything that travels
//!   between processes is defined here so both binaries agree on the exact
//!   field tags.
//

// Declare submodules
pub mod address;
pub mod agents;
pub mod commanding;
pub mod jobs;
pub mod reporting;
