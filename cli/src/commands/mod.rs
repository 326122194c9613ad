//! CLI command definitions and dispatch.

mod destroy;
mod destroy_all;
mod list;
mod list_all;
mod restore;
mod serve;
mod snapshot;
mod start;
mod stop;

use std::path::{Path, PathBuf};

use chv_core::config::{ChvConfig, DEFAULT_CONFIG_PATH};
use clap::{Parser, Subcommand};

use crate::client::ApiClient;

/// chv - cloud-hypervisor VM manager.
#[derive(Parser)]
#[command(name = "chv", version, about)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the VM server in the foreground
    Serve(serve::ServeArgs),
    /// Start a VM
    Start(start::StartArgs),
    /// Stop a running VM
    Stop(stop::StopArgs),
    /// Destroy a VM and release its address
    Destroy(destroy::DestroyArgs),
    /// Destroy every VM
    DestroyAll,
    /// List all VMs
    ListAll,
    /// Show one VM
    List(list::ListArgs),
    /// Snapshot a VM to a directory
    Snapshot(snapshot::SnapshotArgs),
    /// Restore a new VM from a snapshot
    Restore(restore::RestoreArgs),
}

impl Command {
    /// Default log filter when `RUST_LOG` is unset.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Command::Serve(_) => "info",
            _ => "warn",
        }
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = ChvConfig::load(&cli.config)?;
    let client = ApiClient::new(&config.client);

    match cli.command {
        Command::Serve(args) => serve::execute(args, config.server).await,
        Command::Start(args) => start::execute(args, &client).await,
        Command::Stop(args) => stop::execute(args, &client).await,
        Command::Destroy(args) => destroy::execute(args, &client).await,
        Command::DestroyAll => destroy_all::execute(&client).await,
        Command::ListAll => list_all::execute(&client).await,
        Command::List(args) => list::execute(args, &client).await,
        Command::Snapshot(args) => snapshot::execute(args, &client).await,
        Command::Restore(args) => restore::execute(args, &client).await,
    }
}

/// Resolve `path` against the current directory.
pub(crate) fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
