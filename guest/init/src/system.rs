//! [`GuestOs`] backed by the running Linux guest.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chv_core::error::{ChvError, Result};
use chv_core::network::Ipv4Cidr;
use tracing::{debug, info};

use crate::bootstrap::GuestOs;

/// useradd exit status for an existing login.
const USERADD_EXISTS: i32 = 9;

/// Real guest operations. File paths are resolved under `root`.
pub struct LinuxGuest {
    root: PathBuf,
}

impl LinuxGuest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }
}

/// Run a command to completion, mapping failure with `err`.
fn run(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
    err: fn(String) -> ChvError,
) -> Result<std::process::Output> {
    debug!(program, ?args, "Running command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| err(format!("{}: {}", program, e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .map_err(|e| err(format!("{}: {}", program, e)))?;
    }

    child
        .wait_with_output()
        .map_err(|e| err(format!("{}: {}", program, e)))
}

fn check(program: &str, output: &std::process::Output, err: fn(String) -> ChvError) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(err(format!(
        "{} exited with {}: {}",
        program,
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

impl GuestOs for LinuxGuest {
    fn create_user(&self, name: &str, password: &str) -> Result<()> {
        let err = ChvError::UserProvisioning;

        let output = run("useradd", &["-m", "-s", "/bin/bash", name], None, err)?;
        if output.status.code() == Some(USERADD_EXISTS) {
            info!(user = name, "User already exists");
        } else {
            check("useradd", &output, err)?;
        }

        let credentials = format!("{}:{}\n", name, password);
        let output = run("chpasswd", &[], Some(&credentials), err)?;
        check("chpasswd", &output, err)?;

        let output = run("usermod", &["-aG", "sudo", name], None, err)?;
        check("usermod", &output, err)?;

        info!(user = name, "User provisioned");
        Ok(())
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    #[cfg(target_os = "linux")]
    fn mount_subvolume(&self, device: &Path, subvolume: &str, target: &Path) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        let device = self.resolve(device);
        let target = self.resolve(target);
        let options = format!("subvol={}", subvolume);
        mount(
            Some(device.as_path()),
            target.as_path(),
            Some("btrfs"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| {
            ChvError::Mount(format!(
                "{} ({}) on {}: {}",
                device.display(),
                options,
                target.display(),
                e
            ))
        })?;

        info!(device = %device.display(), target = %target.display(), subvolume, "Mounted stateful disk");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn mount_subvolume(&self, _device: &Path, _subvolume: &str, _target: &Path) -> Result<()> {
        Err(ChvError::Mount("mounting requires Linux".to_string()))
    }

    fn reset_ownership(&self, path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.resolve(path);
        std::os::unix::fs::chown(&path, Some(0), Some(0))
            .map_err(|e| ChvError::Mount(format!("chown {}: {}", path.display(), e)))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
            .map_err(|e| ChvError::Mount(format!("chmod {}: {}", path.display(), e)))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        fs::write(self.resolve(path), contents)?;
        Ok(())
    }

    fn append_file(&self, path: &Path, contents: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(path))?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn set_hostname(&self, name: &str) -> Result<()> {
        nix::unistd::sethostname(name)
            .map_err(|e| ChvError::Other(format!("sethostname {}: {}", name, e)))
    }

    #[cfg(not(target_os = "linux"))]
    fn set_hostname(&self, _name: &str) -> Result<()> {
        Err(ChvError::Other("sethostname requires Linux".to_string()))
    }

    #[cfg(target_os = "linux")]
    fn configure_interface(
        &self,
        ifname: &str,
        address: Ipv4Cidr,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        crate::network::configure(ifname, address, gateway)
    }

    #[cfg(not(target_os = "linux"))]
    fn configure_interface(
        &self,
        _ifname: &str,
        _address: Ipv4Cidr,
        _gateway: Ipv4Addr,
    ) -> Result<()> {
        Err(ChvError::NetworkSetup(
            "guest networking requires Linux".to_string(),
        ))
    }

    fn spawn_detached(&self, command: &str) -> Result<u32> {
        use std::os::unix::process::CommandExt;

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| ChvError::Other(format!("failed to start entry point: {}", e)))?;
        Ok(child.id())
    }
}
