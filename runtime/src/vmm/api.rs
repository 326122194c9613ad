//! cloud-hypervisor REST API client over the `--api-socket` Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chv_core::error::{ChvError, Result};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::{Deserialize, Serialize};

const API_PREFIX: &str = "/api/v1";

/// Default bound on a single API request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// cloud-hypervisor API client for one VMM process.
#[derive(Debug, Clone)]
pub struct ChClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
    request_timeout: Duration,
}

impl ChClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Return a clone with a different request timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            socket_path: self.socket_path.clone(),
            client: self.client.clone(),
            request_timeout: timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn uri(&self, endpoint: &str) -> hyper::Uri {
        UnixUri::new(&self.socket_path, &format!("{}/{}", API_PREFIX, endpoint)).into()
    }

    async fn request(&self, method: Method, endpoint: &str, body: Option<String>) -> Result<Vec<u8>> {
        let mut builder = Request::builder().method(method.clone()).uri(self.uri(endpoint));
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json)
            }
            None => Body::empty(),
        };
        let req = builder
            .body(body)
            .map_err(|e| ChvError::Hypervisor(format!("invalid request {}: {}", endpoint, e)))?;

        let resp = tokio::time::timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| {
                ChvError::Timeout(format!(
                    "cloud-hypervisor API {} {} timed out after {:?}",
                    method, endpoint, self.request_timeout
                ))
            })?
            .map_err(|e| {
                ChvError::Hypervisor(format!("cloud-hypervisor API {} {}: {}", method, endpoint, e))
            })?;

        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.map_err(|e| {
            ChvError::Hypervisor(format!("reading response of {}: {}", endpoint, e))
        })?;

        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            return Err(ChvError::Hypervisor(format!(
                "cloud-hypervisor API {} {}: error: {} code: {}",
                method,
                endpoint,
                String::from_utf8_lossy(&bytes),
                status.as_u16()
            )));
        }
        Ok(bytes.to_vec())
    }

    async fn put<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        let json = serde_json::to_string(body)?;
        self.request(Method::PUT, endpoint, Some(json)).await?;
        Ok(())
    }

    async fn put_empty(&self, endpoint: &str) -> Result<()> {
        self.request(Method::PUT, endpoint, None).await?;
        Ok(())
    }

    /// Check that the VMM answers on its socket.
    pub async fn ping(&self) -> Result<VmmPingResponse> {
        let bytes = self.request(Method::GET, "vmm.ping", None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        self.put("vm.create", config).await
    }

    pub async fn boot_vm(&self) -> Result<()> {
        self.put_empty("vm.boot").await
    }

    pub async fn shutdown_vm(&self) -> Result<()> {
        self.put_empty("vm.shutdown").await
    }

    pub async fn pause_vm(&self) -> Result<()> {
        self.put_empty("vm.pause").await
    }

    pub async fn resume_vm(&self) -> Result<()> {
        self.put_empty("vm.resume").await
    }

    pub async fn snapshot_vm(&self, destination: &Path) -> Result<()> {
        self.put(
            "vm.snapshot",
            &VmSnapshotConfig {
                destination_url: file_url(destination),
            },
        )
        .await
    }

    pub async fn restore_vm(&self, source: &Path) -> Result<()> {
        self.put(
            "vm.restore",
            &RestoreConfig {
                source_url: file_url(source),
                prefault: false,
            },
        )
        .await
    }

    /// Ask the VMM process to exit.
    pub async fn shutdown_vmm(&self) -> Result<()> {
        self.put_empty("vmm.shutdown").await
    }
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

// API data structures

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub cpus: CpusConfig,
    pub memory: MemoryConfig,
    pub payload: PayloadConfig,
    pub disks: Vec<DiskConfig>,
    pub net: Vec<NetConfig>,
    pub serial: ConsoleConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpusConfig {
    pub boot_vcpus: u8,
    pub max_vcpus: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Guest memory in bytes
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadConfig {
    pub kernel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    pub tap: String,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub mode: ConsoleMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ConsoleConfig {
    pub fn off() -> Self {
        Self {
            mode: ConsoleMode::Off,
            file: None,
        }
    }

    pub fn file(path: &Path) -> Self {
        Self {
            mode: ConsoleMode::File,
            file: Some(path.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleMode {
    Off,
    Pty,
    Tty,
    File,
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshotConfig {
    pub destination_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreConfig {
    pub source_url: String,
    #[serde(default)]
    pub prefault: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmmPingResponse {
    pub version: String,
    #[serde(default)]
    pub pid: Option<i64>,
}
