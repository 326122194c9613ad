//! Hypervisor - Trait for VMM backend implementations.

use std::path::Path;

use async_trait::async_trait;
use chv_core::error::Result;

use super::spec::{InstanceSpec, RestoreSpec};

/// Control seam between the lifecycle manager and a VMM backend.
///
/// Implementations own every per-VM host resource they create (process,
/// control socket, tap device). A failed `launch` or `restore` must leave
/// nothing behind except what a later `teardown` removes.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Create and boot a VM.
    async fn launch(&self, spec: &InstanceSpec) -> Result<()>;

    /// Gracefully shut down the guest; the VM can still be snapshotted or torn down.
    async fn shutdown(&self, name: &str) -> Result<()>;

    /// Release every host resource held for the VM.
    async fn teardown(&self, name: &str) -> Result<()>;

    /// Pause a running guest.
    async fn pause(&self, name: &str) -> Result<()>;

    /// Resume a paused guest.
    async fn resume(&self, name: &str) -> Result<()>;

    /// Write a snapshot of the VM into `dest` (absolute path).
    async fn snapshot(&self, name: &str, dest: &Path) -> Result<()>;

    /// Start a new VM from a snapshot and leave it running.
    async fn restore(&self, spec: &RestoreSpec) -> Result<()>;
}
