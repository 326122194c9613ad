//! chv Core - Foundational Types
//!
//! Errors, configuration, guest address allocation, boot metadata and the
//! wire types shared by the chv server, CLI and guest init.

pub mod api;
pub mod boot;
pub mod config;
pub mod error;
pub mod network;

// Re-export commonly used types
pub use api::{VmInfo, VmState};
pub use boot::{validate_entry_point, validate_vm_name, BootMetadata, KernelCmdline};
pub use config::{ChvConfig, ClientConfig, HypervisorConfig, ServerConfig};
pub use error::{ChvError, Result};
pub use network::{mac_from_ip, AddressAllocator, Ipv4Cidr};

/// chv version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
