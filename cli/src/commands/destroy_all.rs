//! `chv destroy-all` command.

use crate::client::ApiClient;

pub async fn execute(client: &ApiClient) -> Result<(), Box<dyn std::error::Error>> {
    let _: serde_json::Value = client
        .post("/vm/destroyAll", &serde_json::json!({}))
        .await
        .map_err(|e| format!("failed to destroy all VMs: {e}"))?;

    println!("destroyed all VMs");
    Ok(())
}
