//! Wire types shared by the chv server and its clients.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::network::Ipv4Cidr;

/// VM lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Address reserved, hypervisor launch in progress
    Creating,
    /// Guest booted
    Running,
    /// Guest shut down, address retained
    Stopped,
    /// Snapshot in progress
    Snapshotting,
    /// Restore from snapshot in progress
    Restoring,
    /// Torn down; never observable through the manager
    Destroyed,
}

impl VmState {
    /// Whether a snapshot may be taken from this state.
    pub fn can_snapshot(self) -> bool {
        matches!(self, VmState::Running | VmState::Stopped)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Creating => "creating",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Snapshotting => "snapshotting",
            VmState::Restoring => "restoring",
            VmState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Public view of a VM record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
    pub ip: Ipv4Cidr,
    /// Unknown for VMs restored from a snapshot taken elsewhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// Last snapshot taken, or the snapshot the VM was restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
    pub tap: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartVmRequest {
    pub name: String,
    /// Falls back to the server's `hypervisor.kernel`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathBuf>,
    /// Falls back to the server's `hypervisor.rootfs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

/// Request naming a single VM (stop, destroy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotVmRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotVmResponse {
    pub name: String,
    pub snapshot: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreVmRequest {
    pub name: String,
    pub snapshot: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmListResponse {
    pub vms: Vec<VmInfo>,
}

/// Body of every non-2xx server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Snapshot directory used when the caller names none: `snapshot-<vm>-<local time>`.
pub fn default_snapshot_dir(name: &str) -> PathBuf {
    PathBuf::from(format!(
        "snapshot-{}-{}",
        name,
        Local::now().format("%Y%m%d-%H%M%S")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&VmState::Snapshotting).unwrap(),
            "\"snapshotting\""
        );
        let state: VmState = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(state, VmState::Stopped);
        assert_eq!(VmState::Running.to_string(), "running");
    }

    #[test]
    fn test_can_snapshot() {
        assert!(VmState::Running.can_snapshot());
        assert!(VmState::Stopped.can_snapshot());
        assert!(!VmState::Creating.can_snapshot());
        assert!(!VmState::Snapshotting.can_snapshot());
        assert!(!VmState::Restoring.can_snapshot());
    }

    #[test]
    fn test_vm_info_json_shape() {
        let info = VmInfo {
            name: "vm1".to_string(),
            state: VmState::Running,
            ip: "10.0.0.2/24".parse().unwrap(),
            kernel: Some(PathBuf::from("/images/vmlinux")),
            rootfs: Some(PathBuf::from("/images/rootfs.ext4")),
            entry_point: None,
            snapshot: None,
            tap: "tap0a000002".to_string(),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["ip"], "10.0.0.2/24");
        assert_eq!(value["state"], "running");
        assert!(value.get("entry_point").is_none());
        assert!(value.get("snapshot").is_none());

        let back: VmInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_start_request_optional_entry_point() {
        let req: StartVmRequest = serde_json::from_str(
            r#"{"name":"vm1","kernel":"/k","rootfs":"/r"}"#,
        )
        .unwrap();
        assert!(req.entry_point.is_none());
        assert_eq!(req.kernel, Some(PathBuf::from("/k")));
    }

    #[test]
    fn test_start_request_images_optional() {
        let req: StartVmRequest = serde_json::from_str(r#"{"name":"vm1"}"#).unwrap();
        assert!(req.kernel.is_none());
        assert!(req.rootfs.is_none());
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"name":"vm1"}"#);
    }

    #[test]
    fn test_error_response() {
        let body = serde_json::to_string(&ErrorResponse::new("VM 'x' not found")).unwrap();
        assert_eq!(body, r#"{"error":"VM 'x' not found"}"#);
    }

    #[test]
    fn test_default_snapshot_dir() {
        let dir = default_snapshot_dir("vm1");
        let name = dir.to_str().unwrap();
        assert!(name.starts_with("snapshot-vm1-"));
        // snapshot-vm1-YYYYmmdd-HHMMSS
        assert_eq!(name.len(), "snapshot-vm1-".len() + 15);
        assert!(dir.is_relative());
    }
}
