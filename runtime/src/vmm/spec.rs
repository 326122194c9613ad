//! InstanceSpec - Complete configuration for a VM instance.

use chv_core::network::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete configuration for launching a VM instance.
///
/// Built by the lifecycle manager from the start request, the server config
/// and the reserved address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// VM name (unique per host)
    pub name: String,

    /// Number of vCPUs
    pub vcpus: u8,

    /// Memory in MiB
    pub memory_mib: u64,

    /// Path to the guest kernel
    pub kernel: PathBuf,

    /// Path to the root filesystem image (`/dev/vda`)
    pub rootfs: PathBuf,

    /// Stateful disk image (`/dev/vdb`)
    pub stateful_disk: Option<PathBuf>,

    /// Full kernel command line, boot metadata included
    pub cmdline: String,

    /// Network interface
    pub net: NetSpec,
}

/// Restore a VM from a snapshot directory under a new identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreSpec {
    /// Name of the restored VM
    pub name: String,

    /// Absolute path of the snapshot directory
    pub snapshot_dir: PathBuf,

    /// Network interface the restored VM is attached to
    pub net: NetSpec,
}

/// Host side of a VM's network interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetSpec {
    /// Tap device on the host bridge
    pub tap: String,

    /// Guest MAC address
    pub mac: String,

    /// Guest address with prefix
    pub ip: Ipv4Cidr,
}

impl NetSpec {
    /// Derive the tap device and MAC address from the guest address.
    pub fn for_address(ip: Ipv4Cidr) -> Self {
        Self {
            tap: tap_name(&ip),
            mac: chv_core::network::mac_from_ip(&ip.address()),
            ip,
        }
    }
}

/// Tap device name for a guest address; unique per address and within IFNAMSIZ.
pub fn tap_name(ip: &Ipv4Cidr) -> String {
    format!("tap{:08x}", u32::from(ip.address()))
}
