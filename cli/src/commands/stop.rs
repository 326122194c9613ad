//! `chv stop` command - Gracefully shut a VM down.

use chv_core::api::{VmInfo, VmRequest};
use clap::Args;

use crate::client::ApiClient;

#[derive(Args)]
pub struct StopArgs {
    /// Name of the VM to stop
    #[arg(short, long)]
    pub name: String,
}

pub async fn execute(args: StopArgs, client: &ApiClient) -> Result<(), Box<dyn std::error::Error>> {
    let vm: VmInfo = client
        .post("/vm/stop", &VmRequest { name: args.name })
        .await
        .map_err(|e| format!("failed to stop VM: {e}"))?;

    println!("{} {}", vm.name, vm.state);
    Ok(())
}
