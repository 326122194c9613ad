//! `chv snapshot` command - Capture a VM to a directory.

use std::path::PathBuf;

use chv_core::api::{default_snapshot_dir, SnapshotVmRequest, SnapshotVmResponse};
use clap::Args;

use crate::client::ApiClient;

#[derive(Args)]
pub struct SnapshotArgs {
    /// Name of the VM to snapshot
    #[arg(short, long)]
    pub name: String,

    /// Output directory (default: snapshot-<name>-<timestamp> in the current directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn execute(
    args: SnapshotArgs,
    client: &ApiClient,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = args
        .output
        .unwrap_or_else(|| default_snapshot_dir(&args.name));
    let req = SnapshotVmRequest {
        output: Some(super::absolute(&output)?),
        name: args.name,
    };

    let resp: SnapshotVmResponse = client
        .post("/vm/snapshot", &req)
        .await
        .map_err(|e| format!("failed to create snapshot: {e}"))?;

    println!(
        "snapshot of {} written to {}",
        resp.name,
        resp.snapshot.display()
    );
    Ok(())
}
