use chv_core::error::{ChvError, Result};
use chv_core::network::Ipv4Cidr;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Host bridge plus per-VM tap devices, driven through `ip(8)`.
#[derive(Debug, Clone)]
pub struct HostNetwork {
    bridge: String,
    gateway: Ipv4Cidr,
}

impl HostNetwork {
    pub fn new(bridge: impl Into<String>, gateway: Ipv4Cidr) -> Self {
        Self {
            bridge: bridge.into(),
            gateway,
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub fn gateway(&self) -> Ipv4Cidr {
        self.gateway
    }

    /// Create the bridge if missing, assign the gateway address and bring it up.
    pub async fn ensure_bridge(&self) -> Result<()> {
        let exists = Command::new("ip")
            .args(["link", "show", &self.bridge])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        if !exists {
            info!(bridge = %self.bridge, "Creating host bridge");
            run_ip(&["link", "add", &self.bridge, "type", "bridge"]).await?;
        }

        let gateway = self.gateway.to_string();
        run_ip(&["addr", "replace", &gateway, "dev", &self.bridge]).await?;
        run_ip(&["link", "set", &self.bridge, "up"]).await?;

        debug!(bridge = %self.bridge, gateway = %gateway, "Host bridge ready");
        Ok(())
    }

    /// Create a tap device, attach it to the bridge and bring it up.
    ///
    /// A stale device with the same name is removed first. On failure the
    /// half-configured device is deleted.
    pub async fn create_tap(&self, tap: &str) -> Result<()> {
        debug!(tap = %tap, bridge = %self.bridge, "Creating tap device");

        self.delete_tap(tap).await?;
        run_ip(&["tuntap", "add", tap, "mode", "tap"]).await?;

        let attach = async {
            run_ip(&["link", "set", tap, "master", &self.bridge]).await?;
            run_ip(&["link", "set", tap, "up"]).await
        };
        if let Err(e) = attach.await {
            if let Err(cleanup) = self.delete_tap(tap).await {
                warn!(tap = %tap, error = %cleanup, "Failed to remove tap after setup error");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Delete a tap device; a missing device is not an error.
    pub async fn delete_tap(&self, tap: &str) -> Result<()> {
        let output = Command::new("ip")
            .args(["link", "del", tap])
            .output()
            .await
            .map_err(|e| ChvError::NetworkSetup(format!("executing ip link del: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_device(&stderr) {
                return Ok(());
            }
            return Err(ChvError::NetworkSetup(format!(
                "failed to delete tap {}: {}",
                tap,
                stderr.trim()
            )));
        }
        debug!(tap = %tap, "Deleted tap device");
        Ok(())
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| ChvError::NetworkSetup(format!("executing ip {}: {}", args.join(" "), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ChvError::NetworkSetup(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("Cannot find device") || stderr.contains("does not exist")
}
