//  LIB.rs
//    by OrbitMesh contributors
//
//  Description:
//!   The `orbitmesh-cfg` crate implements the configuration layer for both
//!   OrbitMesh binaries: the YAML-backed `node.yml` file (host or agent
//!   flavour), the `Info` trait for disk-stored configs and the
//!   `<n>[smhd]` interval syntax used throughout them.
//

// Declare the modules
pub mod errors;
pub mod info;
pub mod interval;
pub mod node;
