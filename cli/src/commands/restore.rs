//! `chv restore` command - Boot a new VM from a snapshot.

use std::path::PathBuf;

use chv_core::api::{RestoreVmRequest, VmInfo};
use clap::Args;

use crate::client::ApiClient;

#[derive(Args)]
pub struct RestoreArgs {
    /// Name of the new VM
    #[arg(short, long)]
    pub name: String,

    /// Snapshot directory to restore from
    #[arg(short, long)]
    pub snapshot: PathBuf,
}

pub async fn execute(
    args: RestoreArgs,
    client: &ApiClient,
) -> Result<(), Box<dyn std::error::Error>> {
    let req = RestoreVmRequest {
        name: args.name,
        snapshot: super::absolute(&args.snapshot)?,
    };

    let vm: VmInfo = client
        .post("/vm/restore", &req)
        .await
        .map_err(|e| format!("failed to restore VM: {e}"))?;

    println!(
        "{} restored from {} ({})",
        vm.name,
        req.snapshot.display(),
        vm.ip
    );
    Ok(())
}
