use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChvError, Result};
use crate::network::Ipv4Cidr;

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

/// chv configuration (one YAML file shared by server and client)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChvConfig {
    /// Server-side settings (`chv serve`)
    pub server: ServerConfig,

    /// Client-side settings (every other command)
    pub client: ClientConfig,
}

impl ChvConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content).map_err(|e| {
            ChvError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| ChvError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(ChvError::Config("server.port must be non-zero".to_string()));
        }
        if self.client.server_port == 0 {
            return Err(ChvError::Config(
                "client.server_port must be non-zero".to_string(),
            ));
        }
        if self.server.operation_timeout_secs == 0 || self.server.snapshot_timeout_secs == 0 {
            return Err(ChvError::Config("timeouts must be non-zero".to_string()));
        }
        if self.server.hypervisor.vcpus == 0 || self.server.hypervisor.memory_mib == 0 {
            return Err(ChvError::Config(
                "hypervisor.vcpus and hypervisor.memory_mib must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub host: Ipv4Addr,

    /// Listen port
    pub port: u16,

    /// Per-VM runtime state (API sockets, serial logs)
    pub state_dir: PathBuf,

    /// Host bridge that owns the gateway address
    pub bridge_name: String,

    /// Guest subnet; the first host address is assigned to the bridge
    pub bridge_subnet: String,

    /// Bound on launch/shutdown/teardown hypervisor calls
    pub operation_timeout_secs: u64,

    /// Bound on snapshot/restore hypervisor calls
    pub snapshot_timeout_secs: u64,

    /// cloud-hypervisor settings
    pub hypervisor: HypervisorConfig,
}

impl ServerConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn subnet(&self) -> Result<Ipv4Cidr> {
        self.bridge_subnet.parse()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
            port: 7000,
            state_dir: PathBuf::from("/var/lib/chv"),
            bridge_name: "br0".to_string(),
            bridge_subnet: "10.20.1.0/24".to_string(),
            operation_timeout_secs: 30,
            snapshot_timeout_secs: 300,
            hypervisor: HypervisorConfig::default(),
        }
    }
}

/// cloud-hypervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Path to the cloud-hypervisor binary
    pub binary: PathBuf,

    /// Number of virtual CPUs per VM
    pub vcpus: u8,

    /// Memory per VM in MiB
    pub memory_mib: u64,

    /// Kernel image used when a start request names none
    pub kernel: PathBuf,

    /// Root filesystem image used when a start request names none
    pub rootfs: PathBuf,

    /// Base kernel arguments; boot metadata is appended
    pub kernel_args: String,

    /// Stateful disk attached as the second block device (`/dev/vdb`)
    pub stateful_disk: Option<PathBuf>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./resources/bin/cloud-hypervisor"),
            vcpus: 2,
            memory_mib: 1024,
            kernel: PathBuf::from("./resources/bin/vmlinux.bin"),
            rootfs: PathBuf::from("./resources/bin/rootfs.img"),
            kernel_args: "console=ttyS0 root=/dev/vda rw".to_string(),
            stateful_disk: None,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
}

impl ClientConfig {
    /// Base URL of the chv server
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.server_port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 7000,
        }
    }
}
