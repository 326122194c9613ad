//! VmManager - VM lifecycle state machine.
//!
//! Owns every VM record and the guest address allocator. Records live in a
//! map guarded by a short synchronous lock that only covers insert, remove
//! and lookup. Each record carries its own async operation lock, so two
//! operations on the same VM never interleave while different VMs proceed in
//! parallel. Reads never take the operation lock and may observe transient
//! states.
//!
//! A start or restore whose future is dropped before it finishes is rolled
//! back in the background: the guest is torn down, the record removed and
//! the address freed.

use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chv_core::api::{default_snapshot_dir, RestoreVmRequest, StartVmRequest, VmInfo, VmState};
use chv_core::boot::{validate_entry_point, validate_vm_name, BootMetadata};
use chv_core::config::ServerConfig;
use chv_core::error::{ChvError, Result};
use chv_core::network::{AddressAllocator, Ipv4Cidr};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::vmm::{Hypervisor, InstanceSpec, NetSpec, RestoreSpec};

/// Settings the manager applies to every VM.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub vcpus: u8,
    pub memory_mib: u64,
    /// Kernel image for start requests that name none
    pub kernel: PathBuf,
    /// Root filesystem for start requests that name none
    pub rootfs: PathBuf,
    pub kernel_args: String,
    pub stateful_disk: Option<PathBuf>,
    pub operation_timeout: Duration,
    pub snapshot_timeout: Duration,
}

impl From<&ServerConfig> for ManagerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            vcpus: config.hypervisor.vcpus,
            memory_mib: config.hypervisor.memory_mib,
            kernel: config.hypervisor.kernel.clone(),
            rootfs: config.hypervisor.rootfs.clone(),
            kernel_args: config.hypervisor.kernel_args.clone(),
            stateful_disk: config.hypervisor.stateful_disk.clone(),
            operation_timeout: config.operation_timeout(),
            snapshot_timeout: config.snapshot_timeout(),
        }
    }
}

struct VmEntry {
    op: Arc<AsyncMutex<()>>,
    record: RwLock<VmInfo>,
}

impl VmEntry {
    fn info(&self) -> VmInfo {
        self.record.read().clone()
    }

    fn state(&self) -> VmState {
        self.record.read().state
    }

    fn set_state(&self, state: VmState) {
        self.record.write().state = state;
    }
}

/// VM records and the addresses they hold.
///
/// Lock order: map lock, then the allocator's lock.
struct Registry {
    allocator: AddressAllocator,
    vms: Mutex<HashMap<String, Arc<VmEntry>>>,
}

impl Registry {
    fn lookup(&self, name: &str) -> Option<Arc<VmEntry>> {
        self.vms.lock().get(name).cloned()
    }

    fn is_current(&self, name: &str, entry: &Arc<VmEntry>) -> bool {
        self.vms
            .lock()
            .get(name)
            .map_or(false, |e| Arc::ptr_eq(e, entry))
    }

    fn ensure_absent(&self, name: &str) -> Result<()> {
        if self.vms.lock().contains_key(name) {
            return Err(ChvError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Remove a record and return its address to the pool.
    fn release(&self, name: &str, entry: &Arc<VmEntry>, ip: Ipv4Addr) {
        {
            let mut vms = self.vms.lock();
            if vms.get(name).map_or(false, |e| Arc::ptr_eq(e, entry)) {
                vms.remove(name);
            }
            if let Err(e) = self.allocator.free(ip) {
                tracing::error!(vm = %name, ip = %ip, error = %e, "Failed to free VM address");
            }
        }
        tracing::debug!(
            vm = %name,
            ip = %ip,
            available = self.allocator.available_count(),
            "Released VM address"
        );
    }
}

/// A record inserted on behalf of an accepted start/restore request, with its
/// operation lock already held.
///
/// Until [`Reservation::commit`] is called, dropping it tears the guest down
/// and releases the record on a background task. The operation lock stays
/// held until that cleanup finishes.
struct Reservation {
    registry: Arc<Registry>,
    hypervisor: Arc<dyn Hypervisor>,
    cleanup_timeout: Duration,
    name: String,
    entry: Arc<VmEntry>,
    ip: Ipv4Cidr,
    guard: Option<OwnedMutexGuard<()>>,
    armed: bool,
}

impl Reservation {
    /// Keep the record in `state`.
    fn commit(mut self, state: VmState) -> VmInfo {
        self.armed = false;
        self.entry.set_state(state);
        self.entry.info()
    }

    /// Drop the record without touching the hypervisor.
    fn release(mut self) {
        self.armed = false;
        self.registry.release(&self.name, &self.entry, self.ip.address());
    }

    /// Tear down whatever the hypervisor left behind, then drop the record.
    async fn discard(self) {
        teardown_quietly(self.hypervisor.as_ref(), &self.name, self.cleanup_timeout).await;
        self.release();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!(vm = %self.name, ip = %self.ip, "VM operation abandoned, rolling back");
        let registry = Arc::clone(&self.registry);
        let entry = Arc::clone(&self.entry);
        let name = self.name.clone();
        let ip = self.ip.address();
        let guard = self.guard.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let hypervisor = Arc::clone(&self.hypervisor);
                let timeout = self.cleanup_timeout;
                handle.spawn(async move {
                    teardown_quietly(hypervisor.as_ref(), &name, timeout).await;
                    registry.release(&name, &entry, ip);
                    drop(guard);
                });
            }
            Err(_) => {
                tracing::warn!(vm = %name, "No runtime for cleanup, releasing record only");
                registry.release(&name, &entry, ip);
            }
        }
    }
}

/// VM lifecycle manager.
pub struct VmManager {
    config: ManagerConfig,
    registry: Arc<Registry>,
    hypervisor: Arc<dyn Hypervisor>,
}

impl VmManager {
    /// Create a manager for the server's guest subnet.
    pub fn new(config: &ServerConfig, hypervisor: Arc<dyn Hypervisor>) -> Result<Self> {
        Self::with_config(ManagerConfig::from(config), &config.bridge_subnet, hypervisor)
    }

    pub fn with_config(
        config: ManagerConfig,
        subnet: &str,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Result<Self> {
        let allocator = AddressAllocator::new(subnet)?;
        tracing::info!(
            subnet = %allocator.subnet(),
            gateway = %allocator.gateway(),
            available = allocator.available_count(),
            "VM manager ready"
        );
        Ok(Self {
            config,
            registry: Arc::new(Registry {
                allocator,
                vms: Mutex::new(HashMap::new()),
            }),
            hypervisor,
        })
    }

    /// The guest address allocator.
    pub fn allocator(&self) -> &AddressAllocator {
        &self.registry.allocator
    }

    /// Create and boot a VM.
    ///
    /// A request without `kernel` or `rootfs` uses the configured images.
    pub async fn start(&self, req: StartVmRequest) -> Result<VmInfo> {
        validate_vm_name(&req.name)?;
        if let Some(ep) = &req.entry_point {
            validate_entry_point(ep)?;
        }
        let kernel = absolute(req.kernel.unwrap_or_else(|| self.config.kernel.clone()))?;
        let rootfs = absolute(req.rootfs.unwrap_or_else(|| self.config.rootfs.clone()))?;

        let reservation = self.reserve(&req.name, VmState::Creating, |ip, net| VmInfo {
            name: req.name.clone(),
            state: VmState::Creating,
            ip,
            kernel: Some(kernel.clone()),
            rootfs: Some(rootfs.clone()),
            entry_point: req.entry_point.clone(),
            snapshot: None,
            tap: net.tap.clone(),
            created_at: Utc::now(),
        })?;
        let ip = reservation.ip;

        let metadata = match BootMetadata::new(
            &req.name,
            ip,
            self.registry.allocator.gateway(),
            req.entry_point.clone(),
        ) {
            Ok(metadata) => metadata,
            Err(e) => {
                reservation.release();
                return Err(e);
            }
        };

        let spec = InstanceSpec {
            name: req.name.clone(),
            vcpus: self.config.vcpus,
            memory_mib: self.config.memory_mib,
            kernel,
            rootfs,
            stateful_disk: self.config.stateful_disk.clone(),
            cmdline: metadata.kernel_cmdline(&self.config.kernel_args),
            net: NetSpec::for_address(ip),
        };

        tracing::info!(vm = %req.name, ip = %ip, "Starting VM");
        let launched = bounded(
            self.config.operation_timeout,
            format!("start of VM '{}'", req.name),
            self.hypervisor.launch(&spec),
        )
        .await;

        if let Err(e) = launched {
            tracing::warn!(vm = %req.name, error = %e, "VM start failed");
            reservation.discard().await;
            return Err(e);
        }

        let info = reservation.commit(VmState::Running);
        tracing::info!(vm = %req.name, ip = %ip, "VM running");
        Ok(info)
    }

    /// Gracefully shut down a running VM; its address is retained.
    pub async fn stop(&self, name: &str) -> Result<VmInfo> {
        let (entry, _guard) = self.lock_entry(name).await?;
        let state = entry.state();
        if state != VmState::Running {
            return Err(invalid_state(name, state, "stop"));
        }

        bounded(
            self.config.operation_timeout,
            format!("stop of VM '{}'", name),
            self.hypervisor.shutdown(name),
        )
        .await?;

        entry.set_state(VmState::Stopped);
        tracing::info!(vm = %name, "VM stopped");
        Ok(entry.info())
    }

    /// Tear down a VM in any state, free its address and forget it.
    ///
    /// A teardown failure on a stopped VM is only logged. On any other VM the
    /// record is still removed and the address freed, but the error is returned.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let (entry, _guard) = self.lock_entry(name).await?;
        let state = entry.state();
        let ip = entry.record.read().ip;

        let torn_down = bounded(
            self.config.operation_timeout,
            format!("teardown of VM '{}'", name),
            self.hypervisor.teardown(name),
        )
        .await;

        let result = match torn_down {
            Ok(()) => Ok(()),
            Err(e) if state == VmState::Stopped => {
                tracing::warn!(vm = %name, error = %e, "Teardown of stopped VM failed, ignoring");
                Ok(())
            }
            Err(e) => {
                tracing::error!(vm = %name, state = %state, error = %e, "Teardown failed");
                Err(e)
            }
        };

        self.registry.release(name, &entry, ip.address());
        entry.set_state(VmState::Destroyed);
        tracing::info!(vm = %name, ip = %ip, "VM destroyed");
        result
    }

    /// Destroy every VM. Every VM is attempted; the first error is returned.
    pub async fn destroy_all(&self) -> Result<()> {
        let names: Vec<String> = self.registry.vms.lock().keys().cloned().collect();
        let mut first_error = None;

        for name in names {
            match self.destroy(&name).await {
                Ok(()) | Err(ChvError::NotFound(_)) => {}
                Err(e) => {
                    tracing::error!(vm = %name, error = %e, "Failed to destroy VM");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Snapshot a running or stopped VM and return the absolute snapshot path.
    ///
    /// Without `output` the snapshot goes to `snapshot-<name>-<timestamp>` in
    /// the working directory. A running guest is paused for the duration.
    pub async fn snapshot(&self, name: &str, output: Option<PathBuf>) -> Result<PathBuf> {
        let (entry, _guard) = self.lock_entry(name).await?;
        let prior = entry.state();
        if !prior.can_snapshot() {
            return Err(invalid_state(name, prior, "snapshot"));
        }

        let dest = absolute(output.unwrap_or_else(|| default_snapshot_dir(name)))?;
        entry.set_state(VmState::Snapshotting);
        tracing::info!(vm = %name, dest = %dest.display(), "Taking snapshot");

        let result = self.snapshot_inner(name, &dest, prior == VmState::Running).await;
        entry.set_state(prior);

        result?;
        entry.record.write().snapshot = Some(dest.clone());
        Ok(dest)
    }

    async fn snapshot_inner(&self, name: &str, dest: &Path, running: bool) -> Result<()> {
        if running {
            bounded(
                self.config.operation_timeout,
                format!("pause of VM '{}'", name),
                self.hypervisor.pause(name),
            )
            .await?;
        }

        let snapshot = bounded(
            self.config.snapshot_timeout,
            format!("snapshot of VM '{}'", name),
            self.hypervisor.snapshot(name, dest),
        )
        .await;

        if running {
            let resumed = bounded(
                self.config.operation_timeout,
                format!("resume of VM '{}'", name),
                self.hypervisor.resume(name),
            )
            .await;
            if let Err(e) = resumed {
                tracing::error!(vm = %name, error = %e, "Failed to resume VM after snapshot");
                snapshot?;
                return Err(e);
            }
        }
        snapshot
    }


    /// Boot a new VM from a snapshot under a new name and a fresh address.
    pub async fn restore(&self, req: RestoreVmRequest) -> Result<VmInfo> {
        validate_vm_name(&req.name)?;
        self.registry.ensure_absent(&req.name)?;
        let snapshot_dir = absolute(req.snapshot.clone())?;
        if !snapshot_dir.is_dir() {
            return Err(ChvError::InvalidArgument(format!(
                "snapshot directory not found: {}",
                snapshot_dir.display()
            )));
        }

        let origin = self.snapshot_origin(&snapshot_dir);
        let reservation = self.reserve(&req.name, VmState::Restoring, |ip, net| VmInfo {
            name: req.name.clone(),
            state: VmState::Restoring,
            ip,
            kernel: origin.as_ref().and_then(|o| o.kernel.clone()),
            rootfs: origin.as_ref().and_then(|o| o.rootfs.clone()),
            entry_point: origin.as_ref().and_then(|o| o.entry_point.clone()),
            snapshot: Some(snapshot_dir.clone()),
            tap: net.tap.clone(),
            created_at: Utc::now(),
        })?;
        let ip = reservation.ip;

        let spec = RestoreSpec {
            name: req.name.clone(),
            snapshot_dir: snapshot_dir.clone(),
            net: NetSpec::for_address(ip),
        };

        tracing::info!(vm = %req.name, ip = %ip, snapshot = %snapshot_dir.display(), "Restoring VM");
        let restored = bounded(
            self.config.snapshot_timeout,
            format!("restore of VM '{}'", req.name),
            self.hypervisor.restore(&spec),
        )
        .await;

        if let Err(e) = restored {
            tracing::warn!(vm = %req.name, error = %e, "VM restore failed");
            reservation.discard().await;
            return Err(e);
        }

        let info = reservation.commit(VmState::Running);
        tracing::info!(vm = %req.name, ip = %ip, "VM restored");
        Ok(info)
    }

    /// All VMs, ordered by name.
    pub fn list(&self) -> Vec<VmInfo> {
        let entries: Vec<Arc<VmEntry>> = self.registry.vms.lock().values().cloned().collect();
        let mut vms: Vec<VmInfo> = entries.iter().map(|e| e.info()).collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        vms
    }

    pub fn get(&self, name: &str) -> Result<VmInfo> {
        self.registry
            .lookup(name)
            .map(|e| e.info())
            .ok_or_else(|| ChvError::NotFound(name.to_string()))
    }

    /// Insert a new record holding a fresh address, with its operation lock held.
    fn reserve(
        &self,
        name: &str,
        state: VmState,
        build: impl FnOnce(Ipv4Cidr, &NetSpec) -> VmInfo,
    ) -> Result<Reservation> {
        let op = Arc::new(AsyncMutex::new(()));
        let guard = Arc::clone(&op)
            .try_lock_owned()
            .map_err(|_| ChvError::Other(format!("operation lock for '{}' unavailable", name)))?;

        let mut vms = self.registry.vms.lock();
        if vms.contains_key(name) {
            return Err(ChvError::DuplicateName(name.to_string()));
        }
        let ip = self.registry.allocator.allocate()?;
        let net = NetSpec::for_address(ip);
        let mut record = build(ip, &net);
        record.state = state;

        let entry = Arc::new(VmEntry {
            op,
            record: RwLock::new(record),
        });
        vms.insert(name.to_string(), Arc::clone(&entry));

        Ok(Reservation {
            registry: Arc::clone(&self.registry),
            hypervisor: Arc::clone(&self.hypervisor),
            cleanup_timeout: self.config.operation_timeout,
            name: name.to_string(),
            entry,
            ip,
            guard: Some(guard),
            armed: true,
        })
    }

    /// Look up a record and take its operation lock.
    ///
    /// Fails with `NotFound` if the record was removed while waiting.
    async fn lock_entry(&self, name: &str) -> Result<(Arc<VmEntry>, OwnedMutexGuard<()>)> {
        let entry = self
            .registry
            .lookup(name)
            .ok_or_else(|| ChvError::NotFound(name.to_string()))?;

        let guard = Arc::clone(&entry.op).lock_owned().await;

        if !self.registry.is_current(name, &entry) {
            return Err(ChvError::NotFound(name.to_string()));
        }
        Ok((entry, guard))
    }

    /// The record a snapshot directory was taken from, if still known.
    fn snapshot_origin(&self, snapshot_dir: &Path) -> Option<VmInfo> {
        self.list()
            .into_iter()
            .find(|vm| vm.snapshot.as_deref() == Some(snapshot_dir))
    }
}

fn invalid_state(name: &str, state: VmState, operation: &'static str) -> ChvError {
    ChvError::InvalidState {
        name: name.to_string(),
        state: state.to_string(),
        operation,
    }
}

/// Bounded teardown whose failure is only logged.
async fn teardown_quietly(hypervisor: &dyn Hypervisor, name: &str, timeout: Duration) {
    let torn_down = bounded(
        timeout,
        format!("cleanup of VM '{}'", name),
        hypervisor.teardown(name),
    )
    .await;
    if let Err(e) = torn_down {
        tracing::warn!(vm = %name, error = %e, "Cleanup of failed VM failed");
    }
}

/// Run a hypervisor call under a deadline.
async fn bounded<T>(
    timeout: Duration,
    what: String,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChvError::Timeout(format!(
            "{} did not complete within {:?}",
            what, timeout
        ))),
    }
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
