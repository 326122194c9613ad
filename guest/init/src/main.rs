//! First-boot setup agent for chv guests.
//!
//! Runs once early in boot, reads `/proc/cmdline` and configures the guest
//! from the metadata the host embedded there.

use std::path::PathBuf;
use std::process;

use chv_guest_init::{Bootstrap, BootstrapConfig, LinuxGuest};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chv-guest-init", version, about = "Configure a chv guest on first boot")]
struct Args {
    /// Kernel command line to read metadata from
    #[arg(long, default_value = "/proc/cmdline")]
    cmdline: PathBuf,

    /// Root of the guest filesystem
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Block device holding the stateful btrfs volume
    #[arg(long, default_value = "/dev/vdb")]
    stateful_device: PathBuf,

    /// Interface to configure
    #[arg(long, default_value = "eth0")]
    interface: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cmdline = match std::fs::read_to_string(&args.cmdline) {
        Ok(cmdline) => cmdline,
        Err(e) => {
            error!(path = %args.cmdline.display(), error = %e, "Failed to read kernel command line");
            process::exit(1);
        }
    };

    let guest = LinuxGuest::new(&args.root);
    let config = BootstrapConfig {
        stateful_device: args.stateful_device,
        interface: args.interface,
        ..Default::default()
    };

    match Bootstrap::new(&guest, config).run(cmdline.trim()) {
        Ok(report) => {
            for (step, e) in &report.warnings {
                warn!(step = step.name(), error = %e, "Completed with warning");
            }
            info!(vm_name = %report.vm_name, "Guest init completed successfully");
        }
        Err(e) => {
            error!(error = %e, "Guest init failed");
            process::exit(1);
        }
    }
}
