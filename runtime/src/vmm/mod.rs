//! VMM module - Virtual Machine Manager subsystem.
//!
//! - `Hypervisor`: control seam used by the lifecycle manager
//! - `CloudHypervisor`: cloud-hypervisor backend (one process per VM)
//! - `InstanceSpec` / `RestoreSpec`: launch configuration

mod api;
mod controller;
mod provider;
mod spec;

pub use api::{ChClient, VmConfig, VmmPingResponse};
pub use controller::CloudHypervisor;
pub use provider::Hypervisor;
pub use spec::{tap_name, InstanceSpec, NetSpec, RestoreSpec};
