//! `chv start` command - Boot a new VM.

use std::path::PathBuf;

use chv_core::api::{StartVmRequest, VmInfo};
use clap::Args;

use crate::client::ApiClient;

#[derive(Args)]
pub struct StartArgs {
    /// Name of the VM to create
    #[arg(short, long)]
    pub name: String,

    /// Path of the kernel image to be used (server default if omitted)
    #[arg(short, long)]
    pub kernel: Option<PathBuf>,

    /// Path of the rootfs image to be used (server default if omitted)
    #[arg(short, long)]
    pub rootfs: Option<PathBuf>,

    /// Command the guest runs once it is reachable
    #[arg(short, long)]
    pub entry_point: Option<String>,
}

pub async fn execute(args: StartArgs, client: &ApiClient) -> Result<(), Box<dyn std::error::Error>> {
    let req = StartVmRequest {
        name: args.name,
        kernel: args.kernel.as_deref().map(super::absolute).transpose()?,
        rootfs: args.rootfs.as_deref().map(super::absolute).transpose()?,
        entry_point: args.entry_point,
    };

    let vm: VmInfo = client
        .post("/vm/start", &req)
        .await
        .map_err(|e| format!("failed to start VM: {e}"))?;

    tracing::info!(name = %vm.name, ip = %vm.ip, "Started VM");
    println!("{} started ({})", vm.name, vm.ip);
    Ok(())
}
