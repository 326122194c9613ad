//! `chv serve` command - Run the VM server in the foreground.
//!
//! Prepares the host bridge, then serves the REST API until Ctrl-C. Every VM
//! is destroyed on the way out.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chv_core::config::ServerConfig;
use chv_core::network::AddressAllocator;
use chv_runtime::{CloudHypervisor, HostNetwork, VmManager};
use clap::Args;

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on (overrides the config file)
    #[arg(long)]
    pub host: Option<Ipv4Addr>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,
}

pub async fn execute(
    args: ServeArgs,
    mut config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let gateway = AddressAllocator::new(&config.bridge_subnet)?.gateway();
    let network = HostNetwork::new(&config.bridge_name, gateway);
    network.ensure_bridge().await?;

    let hypervisor = Arc::new(CloudHypervisor::new(&config, network));
    let manager = Arc::new(VmManager::new(&config, hypervisor)?);

    let addr = SocketAddr::from((config.host, config.port));
    chv_runtime::serve(manager, addr, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
