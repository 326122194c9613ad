//! `chv list-all` command - Table of every VM.

use chv_core::api::VmListResponse;

use crate::client::ApiClient;
use crate::output;

pub async fn execute(client: &ApiClient) -> Result<(), Box<dyn std::error::Error>> {
    let resp: VmListResponse = client
        .get("/vm/list")
        .await
        .map_err(|e| format!("failed to list all VMs: {e}"))?;

    println!("{}", output::vm_table(&resp.vms));
    Ok(())
}
