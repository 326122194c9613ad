//! `chv list` command - Details of one VM as JSON.

use chv_core::api::VmInfo;
use clap::Args;

use crate::client::ApiClient;
use crate::output;

#[derive(Args)]
pub struct ListArgs {
    /// Name of the VM
    #[arg(short, long)]
    pub name: String,
}

pub async fn execute(args: ListArgs, client: &ApiClient) -> Result<(), Box<dyn std::error::Error>> {
    let vm: VmInfo = client
        .get(&format!("/vm/{}", args.name))
        .await
        .map_err(|e| format!("failed to list VM: {e}"))?;

    println!("{}", output::to_pretty_json(&vm)?);
    Ok(())
}
