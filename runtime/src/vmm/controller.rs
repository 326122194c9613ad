//! CloudHypervisor - Runs one cloud-hypervisor process per VM.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chv_core::config::ServerConfig;
use chv_core::error::{ChvError, Result};
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

use super::api::{
    ChClient, ConsoleConfig, CpusConfig, DiskConfig, MemoryConfig, NetConfig, PayloadConfig,
    VmConfig,
};
use super::provider::Hypervisor;
use super::spec::{InstanceSpec, NetSpec, RestoreSpec};
use crate::network::HostNetwork;

const API_SOCKET: &str = "api.sock";
const SERIAL_LOG: &str = "serial.log";
const VMM_LOG: &str = "vmm.log";
const RESTORE_DIR: &str = "restore";

/// Poll interval and attempts while waiting for the API socket.
const SOCKET_WAIT_RETRY_DELAY: Duration = Duration::from_millis(50);
const SOCKET_WAIT_RETRY_COUNT: u32 = 200;

/// How long teardown waits for the VMM to exit before killing it.
const VMM_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A running cloud-hypervisor process.
struct Instance {
    client: ChClient,
    process: AsyncMutex<Option<Child>>,
    tap: String,
    dir: PathBuf,
}

/// [`Hypervisor`] backed by cloud-hypervisor.
///
/// Per-VM state lives in `<state_dir>/<name>/`: the API socket, the serial
/// log and the VMM's own stderr.
pub struct CloudHypervisor {
    binary: PathBuf,
    state_dir: PathBuf,
    snapshot_timeout: Duration,
    network: HostNetwork,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
}

impl CloudHypervisor {
    pub fn new(config: &ServerConfig, network: HostNetwork) -> Self {
        Self {
            binary: config.hypervisor.binary.clone(),
            state_dir: config.state_dir.clone(),
            snapshot_timeout: config.snapshot_timeout(),
            network,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    fn instance(&self, name: &str) -> Result<Arc<Instance>> {
        self.instances
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ChvError::Hypervisor(format!("no cloud-hypervisor process for VM '{}'", name)))
    }

    /// Prepare the VM directory and tap, spawn the VMM and wait for its socket.
    ///
    /// The instance is registered before anything can fail after the tap is
    /// created, so `teardown` always finds what was left behind.
    async fn spawn_vmm(&self, name: &str, net: &NetSpec) -> Result<Arc<Instance>> {
        if !self.binary.exists() {
            return Err(ChvError::Hypervisor(format!(
                "cloud-hypervisor binary not found: {}",
                self.binary.display()
            )));
        }

        let dir = self.vm_dir(name);
        tokio::fs::create_dir_all(&dir).await?;
        let socket_path = dir.join(API_SOCKET);
        let _ = std::fs::remove_file(&socket_path);

        self.network.create_tap(&net.tap).await?;

        let stderr = std::fs::File::create(dir.join(VMM_LOG))?;
        let spawned = Command::new(&self.binary)
            .arg("--api-socket")
            .arg(format!("path={}", socket_path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = self.network.delete_tap(&net.tap).await;
                return Err(ChvError::Hypervisor(format!(
                    "failed to spawn {}: {}",
                    self.binary.display(),
                    e
                )));
            }
        };

        tracing::info!(
            vm = %name,
            pid = child.id(),
            socket = %socket_path.display(),
            "Spawned cloud-hypervisor"
        );

        let instance = Arc::new(Instance {
            client: ChClient::new(&socket_path),
            process: AsyncMutex::new(Some(child)),
            tap: net.tap.clone(),
            dir,
        });
        self.instances
            .lock()
            .insert(name.to_string(), Arc::clone(&instance));

        wait_for_socket(&instance).await?;
        let ping = instance.client.ping().await?;
        tracing::debug!(vm = %name, version = %ping.version, "cloud-hypervisor API ready");

        Ok(instance)
    }

    /// Undo a failed launch or restore.
    async fn abort(&self, name: &str, err: ChvError) -> ChvError {
        tracing::warn!(vm = %name, error = %err, "Launch failed, releasing resources");
        if let Err(cleanup) = self.teardown(name).await {
            tracing::warn!(vm = %name, error = %cleanup, "Cleanup after failed launch failed");
        }
        err
    }

    fn vm_config(spec: &InstanceSpec, dir: &Path) -> VmConfig {
        let mut disks = vec![DiskConfig {
            path: spec.rootfs.display().to_string(),
            readonly: false,
        }];
        if let Some(stateful) = &spec.stateful_disk {
            disks.push(DiskConfig {
                path: stateful.display().to_string(),
                readonly: false,
            });
        }

        VmConfig {
            cpus: CpusConfig {
                boot_vcpus: spec.vcpus,
                max_vcpus: spec.vcpus,
            },
            memory: MemoryConfig {
                size: spec.memory_mib * 1024 * 1024,
            },
            payload: PayloadConfig {
                kernel: spec.kernel.display().to_string(),
                cmdline: Some(spec.cmdline.clone()),
            },
            disks,
            net: vec![NetConfig {
                tap: spec.net.tap.clone(),
                mac: spec.net.mac.clone(),
            }],
            serial: ConsoleConfig::file(&dir.join(SERIAL_LOG)),
            console: ConsoleConfig::off(),
        }
    }
}

#[async_trait]
impl Hypervisor for CloudHypervisor {
    async fn launch(&self, spec: &InstanceSpec) -> Result<()> {
        tracing::debug!(
            vm = %spec.name,
            vcpus = spec.vcpus,
            memory_mib = spec.memory_mib,
            tap = %spec.net.tap,
            "Launching VM"
        );

        let instance = match self.spawn_vmm(&spec.name, &spec.net).await {
            Ok(instance) => instance,
            Err(e) => return Err(self.abort(&spec.name, e).await),
        };

        let config = Self::vm_config(spec, &instance.dir);
        let booted = async {
            instance.client.create_vm(&config).await?;
            instance.client.boot_vm().await
        };
        if let Err(e) = booted.await {
            return Err(self.abort(&spec.name, e).await);
        }

        tracing::info!(vm = %spec.name, ip = %spec.net.ip, "VM booted");
        Ok(())
    }

    async fn shutdown(&self, name: &str) -> Result<()> {
        self.instance(name)?.client.shutdown_vm().await
    }

    async fn teardown(&self, name: &str) -> Result<()> {
        let removed = self.instances.lock().remove(name);
        let Some(instance) = removed else {
            tracing::debug!(vm = %name, "No cloud-hypervisor process to tear down");
            return Ok(());
        };

        let asked_to_exit = instance
            .client
            .with_timeout(Duration::from_secs(2))
            .shutdown_vmm()
            .await;

        if let Some(mut child) = instance.process.lock().await.take() {
            if let Err(e) = asked_to_exit {
                tracing::debug!(vm = %name, error = %e, "vmm.shutdown failed, sending SIGTERM");
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
            }
            reap(name, &mut child, VMM_EXIT_TIMEOUT).await;
        }

        let tap_result = self.network.delete_tap(&instance.tap).await;

        if let Err(e) = tokio::fs::remove_dir_all(&instance.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(vm = %name, dir = %instance.dir.display(), error = %e, "Failed to remove VM directory");
            }
        }

        tap_result
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.instance(name)?.client.pause_vm().await
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.instance(name)?.client.resume_vm().await
    }

    async fn snapshot(&self, name: &str, dest: &Path) -> Result<()> {
        let instance = self.instance(name)?;
        tokio::fs::create_dir_all(dest).await?;
        instance
            .client
            .with_timeout(self.snapshot_timeout)
            .snapshot_vm(dest)
            .await?;
        tracing::info!(vm = %name, dest = %dest.display(), "Snapshot written");
        Ok(())
    }

    async fn restore(&self, spec: &RestoreSpec) -> Result<()> {
        if !spec.snapshot_dir.is_dir() {
            return Err(ChvError::InvalidArgument(format!(
                "snapshot directory not found: {}",
                spec.snapshot_dir.display()
            )));
        }

        let instance = match self.spawn_vmm(&spec.name, &spec.net).await {
            Ok(instance) => instance,
            Err(e) => return Err(self.abort(&spec.name, e).await),
        };

        let restored = async {
            let source = instance.dir.join(RESTORE_DIR);
            stage_snapshot(&spec.snapshot_dir, &source, &spec.net, &instance.dir).await?;
            instance
                .client
                .with_timeout(self.snapshot_timeout)
                .restore_vm(&source)
                .await?;
            instance.client.resume_vm().await
        };
        if let Err(e) = restored.await {
            return Err(self.abort(&spec.name, e).await);
        }

        tracing::info!(
            vm = %spec.name,
            snapshot = %spec.snapshot_dir.display(),
            "VM restored"
        );
        Ok(())
    }
}

async fn wait_for_socket(instance: &Instance) -> Result<()> {
    let socket = instance.client.socket_path();
    for _ in 0..SOCKET_WAIT_RETRY_COUNT {
        if socket.exists() {
            return Ok(());
        }
        if let Some(child) = instance.process.lock().await.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ChvError::Hypervisor(format!(
                    "cloud-hypervisor exited during startup ({}), see {}",
                    status,
                    instance.dir.join(VMM_LOG).display()
                )));
            }
        }
        tokio::time::sleep(SOCKET_WAIT_RETRY_DELAY).await;
    }
    Err(ChvError::Hypervisor(format!(
        "API socket {} not ready after {:?}",
        socket.display(),
        SOCKET_WAIT_RETRY_DELAY * SOCKET_WAIT_RETRY_COUNT
    )))
}

/// Stage a snapshot for restore under a new identity.
///
/// Files are hard-linked (copied across filesystems) into `dest`; the saved
/// `config.json` is rewritten to use the new tap device, MAC and serial log.
async fn stage_snapshot(src: &Path, dest: &Path, net: &NetSpec, vm_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dest).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() || entry.file_name() == "config.json" {
            continue;
        }
        let target = dest.join(entry.file_name());
        if tokio::fs::hard_link(entry.path(), &target).await.is_err() {
            tokio::fs::copy(entry.path(), &target).await?;
        }
    }

    let raw = tokio::fs::read(src.join("config.json")).await?;
    let mut config: serde_json::Value = serde_json::from_slice(&raw)?;
    rewrite_snapshot_config(&mut config, net, &vm_dir.join(SERIAL_LOG));
    tokio::fs::write(dest.join("config.json"), serde_json::to_vec_pretty(&config)?).await?;
    Ok(())
}

fn rewrite_snapshot_config(config: &mut serde_json::Value, net: &NetSpec, serial_log: &Path) {
    if let Some(nets) = config.get_mut("net").and_then(|v| v.as_array_mut()) {
        if let Some(first) = nets.first_mut() {
            first["tap"] = serde_json::Value::from(net.tap.clone());
            first["mac"] = serde_json::Value::from(net.mac.clone());
        }
    }
    if let Some(serial) = config.get_mut("serial") {
        if serial.get("mode").and_then(|m| m.as_str()) == Some("File") {
            serial["file"] = serde_json::Value::from(serial_log.display().to_string());
        }
    }
}

/// Wait up to `grace` for the VMM process to exit, then SIGKILL it.
async fn reap(name: &str, child: &mut Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(vm = %name, ?status, "cloud-hypervisor exited"),
        _ => {
            tracing::warn!(vm = %name, "cloud-hypervisor did not exit, sending SIGKILL");
            if let Err(e) = child.kill().await {
                tracing::warn!(vm = %name, error = %e, "Failed to kill cloud-hypervisor");
            }
        }
    }
}
