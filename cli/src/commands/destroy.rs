//! `chv destroy` command - Tear a VM down and release its address.

use chv_core::api::VmRequest;
use clap::Args;

use crate::client::ApiClient;

#[derive(Args)]
pub struct DestroyArgs {
    /// Name of the VM to destroy
    #[arg(short, long)]
    pub name: String,
}

pub async fn execute(
    args: DestroyArgs,
    client: &ApiClient,
) -> Result<(), Box<dyn std::error::Error>> {
    let req = VmRequest { name: args.name };
    let _: VmRequest = client
        .post("/vm/destroy", &req)
        .await
        .map_err(|e| format!("failed to destroy VM: {e}"))?;

    println!("{} destroyed", req.name);
    Ok(())
}
