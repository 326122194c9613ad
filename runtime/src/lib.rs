//! chv Runtime - VM lifecycle on top of cloud-hypervisor.
//!
//! This crate provides the lifecycle manager, the cloud-hypervisor backend,
//! host bridge/tap plumbing and the REST server that fronts them.

pub mod manager;
pub mod network;
pub mod server;
pub mod vmm;

#[cfg(test)]
mod testing;

// Re-export common types
pub use manager::{ManagerConfig, VmManager};
pub use network::HostNetwork;
pub use server::serve;
pub use vmm::{CloudHypervisor, Hypervisor, InstanceSpec, NetSpec, RestoreSpec};

/// chv Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
