//! Guest init library for chv VMs.
//!
//! Reads the boot metadata the host placed on the kernel command line and
//! prepares the guest: user, stateful home, hostname, network, entry point.

pub mod bootstrap;
#[cfg(target_os = "linux")]
pub mod network;
pub mod system;

pub use bootstrap::{BootReport, Bootstrap, BootstrapConfig, GuestOs, Severity, Step};
pub use system::LinuxGuest;
