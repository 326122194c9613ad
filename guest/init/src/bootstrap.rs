//! First-boot guest setup pipeline.
//!
//! The host passes identity and network metadata on the kernel command line.
//! The pipeline consumes it in a fixed order; every step is either fatal
//! (abort boot) or recoverable (log and continue).

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chv_core::boot::{KernelCmdline, KEY_ENTRY_POINT, KEY_GATEWAY_IP, KEY_GUEST_IP, KEY_VM_NAME};
use chv_core::error::{ChvError, Result};
use chv_core::network::Ipv4Cidr;
use tracing::{error, info, warn};

/// Password given to the per-VM user.
pub const DEFAULT_PASSWORD: &str = "elara0000";

/// Host operations the pipeline needs. Paths are absolute guest paths.
pub trait GuestOs {
    /// Create `name` with a home directory, set its password and add it to `sudo`.
    fn create_user(&self, name: &str, password: &str) -> Result<()>;

    fn path_exists(&self, path: &Path) -> bool;

    /// Mount btrfs sub-volume `subvolume` of `device` on `target`.
    fn mount_subvolume(&self, device: &Path, subvolume: &str, target: &Path) -> Result<()>;

    /// Set owner to root:root and mode to `mode`.
    fn reset_ownership(&self, path: &Path, mode: u32) -> Result<()>;

    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    fn append_file(&self, path: &Path, contents: &str) -> Result<()>;

    fn set_hostname(&self, name: &str) -> Result<()>;

    /// Bring up loopback and `ifname`, assign `address`, add a default route via `gateway`.
    fn configure_interface(&self, ifname: &str, address: Ipv4Cidr, gateway: Ipv4Addr)
        -> Result<()>;

    /// Start `command` through the shell without waiting for it. Returns its PID.
    fn spawn_detached(&self, command: &str) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Recoverable,
}

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Identity,
    User,
    StatefulDisk,
    Hostname,
    NetworkMetadata,
    Network,
    EntryPoint,
}

impl Step {
    pub const PIPELINE: [Step; 7] = [
        Step::Identity,
        Step::User,
        Step::StatefulDisk,
        Step::Hostname,
        Step::NetworkMetadata,
        Step::Network,
        Step::EntryPoint,
    ];

    pub fn severity(self) -> Severity {
        match self {
            Step::User | Step::EntryPoint => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::Identity => "identity",
            Step::User => "user",
            Step::StatefulDisk => "stateful-disk",
            Step::Hostname => "hostname",
            Step::NetworkMetadata => "network-metadata",
            Step::Network => "network",
            Step::EntryPoint => "entry-point",
        }
    }
}

/// Guest layout the pipeline targets.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub stateful_device: PathBuf,
    pub home: PathBuf,
    pub interface: String,
    pub nameserver: Ipv4Addr,
    pub password: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            stateful_device: PathBuf::from("/dev/vdb"),
            home: PathBuf::from("/home"),
            interface: "eth0".to_string(),
            nameserver: Ipv4Addr::new(8, 8, 8, 8),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

/// State accumulated while the pipeline runs.
#[derive(Debug, Default)]
struct BootContext {
    vm_name: Option<String>,
    guest_ip: Option<Ipv4Cidr>,
    gateway: Option<Ipv4Addr>,
}

impl BootContext {
    fn vm_name(&self) -> Result<&str> {
        self.vm_name
            .as_deref()
            .ok_or_else(|| ChvError::MissingBootParameter(KEY_VM_NAME.to_string()))
    }
}

/// Outcome of a completed pipeline.
#[derive(Debug, Default)]
pub struct BootReport {
    pub vm_name: String,
    /// Recoverable steps that failed, with their errors.
    pub warnings: Vec<(Step, String)>,
    /// PID of the entry point, if one was started.
    pub entry_point_pid: Option<u32>,
}

/// Runs [`Step::PIPELINE`] against a [`GuestOs`].
pub struct Bootstrap<'a, O: GuestOs> {
    os: &'a O,
    config: BootstrapConfig,
}

impl<'a, O: GuestOs> Bootstrap<'a, O> {
    pub fn new(os: &'a O, config: BootstrapConfig) -> Self {
        Self { os, config }
    }

    /// Run every step against `cmdline`; stops at the first fatal failure.
    pub fn run(&self, cmdline: &str) -> Result<BootReport> {
        let cmdline = KernelCmdline::parse(cmdline)?;
        let mut ctx = BootContext::default();
        let mut report = BootReport::default();

        for step in Step::PIPELINE {
            match self.execute(step, &cmdline, &mut ctx, &mut report) {
                Ok(()) => info!(step = step.name(), "Boot step complete"),
                Err(e) => match step.severity() {
                    Severity::Fatal => {
                        error!(step = step.name(), error = %e, "Boot step failed");
                        return Err(e);
                    }
                    Severity::Recoverable => {
                        warn!(step = step.name(), error = %e, "Boot step failed, continuing");
                        report.warnings.push((step, e.to_string()));
                    }
                },
            }
        }

        report.vm_name = ctx.vm_name()?.to_string();
        Ok(report)
    }

    fn execute(
        &self,
        step: Step,
        cmdline: &KernelCmdline,
        ctx: &mut BootContext,
        report: &mut BootReport,
    ) -> Result<()> {
        match step {
            Step::Identity => {
                let name = cmdline.require(KEY_VM_NAME)?;
                chv_core::boot::validate_vm_name(name)
                    .map_err(|e| ChvError::MissingBootParameter(e.to_string()))?;
                info!(vm_name = %name, "Guest identity");
                ctx.vm_name = Some(name.to_string());
                Ok(())
            }
            Step::User => {
                let name = ctx.vm_name()?;
                self.os.create_user(name, &self.config.password)
            }
            Step::StatefulDisk => {
                let name = ctx.vm_name()?;
                if !self.os.path_exists(&self.config.stateful_device) {
                    warn!(
                        device = %self.config.stateful_device.display(),
                        "No stateful disk attached, keeping {} on the root filesystem",
                        self.config.home.display()
                    );
                    return Ok(());
                }
                self.os
                    .mount_subvolume(&self.config.stateful_device, name, &self.config.home)?;
                self.os.reset_ownership(&self.config.home, 0o777)
            }
            Step::Hostname => {
                let name = ctx.vm_name()?;
                self.os.write_file(Path::new("/etc/hostname"), &format!("{}\n", name))?;
                self.os.set_hostname(name)?;
                self.os
                    .append_file(Path::new("/etc/hosts"), &format!("127.0.1.1\t{}\n", name))
            }
            Step::NetworkMetadata => {
                ctx.guest_ip = Some(cmdline.require_cidr(KEY_GUEST_IP)?);
                ctx.gateway = Some(cmdline.require_address(KEY_GATEWAY_IP)?);
                Ok(())
            }
            Step::Network => {
                let (Some(guest_ip), Some(gateway)) = (ctx.guest_ip, ctx.gateway) else {
                    return Err(ChvError::MissingBootParameter(KEY_GUEST_IP.to_string()));
                };
                info!(ip = %guest_ip, gateway = %gateway, ifname = %self.config.interface, "Configuring guest network");
                self.os
                    .configure_interface(&self.config.interface, guest_ip, gateway)?;
                self.os.append_file(
                    Path::new("/etc/resolv.conf"),
                    &format!("nameserver {}\n", self.config.nameserver),
                )
            }
            Step::EntryPoint => {
                if let Some(command) = cmdline.get(KEY_ENTRY_POINT) {
                    let pid = self.os.spawn_detached(command)?;
                    info!(pid, command = %command, "Entry point started");
                    report.entry_point_pid = Some(pid);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// Records every call; named operations can be made to fail.
    #[derive(Default)]
    struct FakeGuest {
        calls: RefCell<Vec<String>>,
        failing: HashSet<&'static str>,
        missing_paths: HashSet<PathBuf>,
    }

    impl FakeGuest {
        fn failing(ops: &[&'static str]) -> Self {
            Self {
                failing: ops.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn call(&self, op: &'static str, detail: String) -> Result<()> {
            self.calls.borrow_mut().push(format!("{} {}", op, detail));
            if self.failing.contains(op) {
                return Err(match op {
                    "create_user" => ChvError::UserProvisioning("useradd: exit 9".to_string()),
                    "mount_subvolume" => ChvError::Mount("no such subvolume".to_string()),
                    "configure_interface" => ChvError::NetworkSetup("SIOCSIFADDR".to_string()),
                    _ => ChvError::Other(format!("{} failed", op)),
                });
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn ops(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|c| c.split(' ').next().unwrap_or_default().to_string())
                .collect()
        }
    }

    impl GuestOs for FakeGuest {
        fn create_user(&self, name: &str, password: &str) -> Result<()> {
            self.call("create_user", format!("{}:{}", name, password))
        }

        fn path_exists(&self, path: &Path) -> bool {
            !self.missing_paths.contains(path)
        }

        fn mount_subvolume(&self, device: &Path, subvolume: &str, target: &Path) -> Result<()> {
            self.call(
                "mount_subvolume",
                format!("{} {} {}", device.display(), subvolume, target.display()),
            )
        }

        fn reset_ownership(&self, path: &Path, mode: u32) -> Result<()> {
            self.call("reset_ownership", format!("{} {:o}", path.display(), mode))
        }

        fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
            self.call("write_file", format!("{} {:?}", path.display(), contents))
        }

        fn append_file(&self, path: &Path, contents: &str) -> Result<()> {
            self.call("append_file", format!("{} {:?}", path.display(), contents))
        }

        fn set_hostname(&self, name: &str) -> Result<()> {
            self.call("set_hostname", name.to_string())
        }

        fn configure_interface(
            &self,
            ifname: &str,
            address: Ipv4Cidr,
            gateway: Ipv4Addr,
        ) -> Result<()> {
            self.call(
                "configure_interface",
                format!("{} {} {}", ifname, address, gateway),
            )
        }

        fn spawn_detached(&self, command: &str) -> Result<u32> {
            self.call("spawn_detached", command.to_string())?;
            Ok(4242)
        }
    }

    const CMDLINE: &str = r#"console=ttyS0 root=/dev/vda rw vm_name="vm1" guest_ip="10.0.0.2/24" gateway_ip="10.0.0.1/24""#;

    fn run(os: &FakeGuest, cmdline: &str) -> Result<BootReport> {
        Bootstrap::new(os, BootstrapConfig::default()).run(cmdline)
    }

    #[test]
    fn test_pipeline_order() {
        let os = FakeGuest::default();
        let report = run(&os, CMDLINE).unwrap();

        assert_eq!(report.vm_name, "vm1");
        assert!(report.warnings.is_empty());
        assert_eq!(
            os.ops(),
            vec![
                "create_user",
                "mount_subvolume",
                "reset_ownership",
                "write_file",
                "set_hostname",
                "append_file",
                "configure_interface",
                "append_file",
            ]
        );
    }

    #[test]
    fn test_pipeline_arguments() {
        let os = FakeGuest::default();
        run(&os, CMDLINE).unwrap();
        let calls = os.calls();

        assert_eq!(calls[0], format!("create_user vm1:{}", DEFAULT_PASSWORD));
        assert_eq!(calls[1], "mount_subvolume /dev/vdb vm1 /home");
        assert_eq!(calls[2], "reset_ownership /home 777");
        assert_eq!(calls[3], r#"write_file /etc/hostname "vm1\n""#);
        assert_eq!(calls[5], r#"append_file /etc/hosts "127.0.1.1\tvm1\n""#);
        assert_eq!(calls[6], "configure_interface eth0 10.0.0.2/24 10.0.0.1");
        assert_eq!(calls[7], r#"append_file /etc/resolv.conf "nameserver 8.8.8.8\n""#);
    }

    #[test]
    fn test_missing_vm_name_is_fatal_before_any_side_effect() {
        let os = FakeGuest::default();
        let result = run(&os, r#"guest_ip="10.0.0.2/24" gateway_ip="10.0.0.1/24""#);
        assert!(matches!(result, Err(ChvError::MissingBootParameter(_))));
        assert!(os.calls().is_empty());
    }

    #[test]
    fn test_user_failure_is_recoverable() {
        let os = FakeGuest::failing(&["create_user"]);
        let report = run(&os, CMDLINE).unwrap();

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].0, Step::User);
        assert!(os.ops().contains(&"configure_interface".to_string()));
    }

    #[test]
    fn test_mount_failure_is_fatal() {
        let os = FakeGuest::failing(&["mount_subvolume"]);
        let result = run(&os, CMDLINE);

        assert!(matches!(result, Err(ChvError::Mount(_))));
        let ops = os.ops();
        assert_eq!(ops.last().map(String::as_str), Some("mount_subvolume"));
        assert!(!ops.contains(&"set_hostname".to_string()));
    }

    #[test]
    fn test_missing_stateful_disk_skips_mount() {
        let mut os = FakeGuest::default();
        os.missing_paths.insert(PathBuf::from("/dev/vdb"));
        run(&os, CMDLINE).unwrap();

        let ops = os.ops();
        assert!(!ops.contains(&"mount_subvolume".to_string()));
        assert!(!ops.contains(&"reset_ownership".to_string()));
        assert!(ops.contains(&"configure_interface".to_string()));
    }

    #[test]
    fn test_missing_network_metadata_is_fatal_after_hostname() {
        let os = FakeGuest::default();
        let result = run(&os, r#"vm_name="vm1" guest_ip="10.0.0.2/24""#);

        assert!(matches!(result, Err(ChvError::MissingBootParameter(_))));
        let ops = os.ops();
        assert!(ops.contains(&"set_hostname".to_string()));
        assert!(!ops.contains(&"configure_interface".to_string()));
    }

    #[test]
    fn test_bare_gateway_accepted() {
        let os = FakeGuest::default();
        run(&os, r#"vm_name="vm1" guest_ip="10.0.0.2/24" gateway_ip="10.0.0.1""#).unwrap();
        assert!(os
            .calls()
            .contains(&"configure_interface eth0 10.0.0.2/24 10.0.0.1".to_string()));
    }

    #[test]
    fn test_network_failure_is_fatal() {
        let os = FakeGuest::failing(&["configure_interface"]);
        let result = run(&os, CMDLINE);
        assert!(matches!(result, Err(ChvError::NetworkSetup(_))));
        assert!(!os.calls().iter().any(|c| c.contains("resolv.conf")));
    }

    #[test]
    fn test_entry_point_started_last() {
        let os = FakeGuest::default();
        let cmdline = format!(r#"{} entry_point="/usr/bin/app --serve""#, CMDLINE);
        let report = run(&os, &cmdline).unwrap();

        assert_eq!(report.entry_point_pid, Some(4242));
        assert_eq!(
            os.calls().last().map(String::as_str),
            Some("spawn_detached /usr/bin/app --serve")
        );
    }

    #[test]
    fn test_entry_point_failure_is_recoverable() {
        let os = FakeGuest::failing(&["spawn_detached"]);
        let cmdline = format!(r#"{} entry_point="/missing""#, CMDLINE);
        let report = run(&os, &cmdline).unwrap();

        assert!(report.entry_point_pid.is_none());
        assert_eq!(report.warnings[0].0, Step::EntryPoint);
    }

    #[test]
    fn test_step_severity() {
        assert_eq!(Step::Identity.severity(), Severity::Fatal);
        assert_eq!(Step::User.severity(), Severity::Recoverable);
        assert_eq!(Step::StatefulDisk.severity(), Severity::Fatal);
        assert_eq!(Step::EntryPoint.severity(), Severity::Recoverable);
    }
}
