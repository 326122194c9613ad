//! Guest boot metadata carried on the kernel command line.
//!
//! The host appends quoted `key="value"` tokens to the guest kernel command
//! line; the guest init reads them back from `/proc/cmdline`.
//!
//! Keys:
//! - `vm_name`: VM identity, used as hostname, user name and sub-volume name
//! - `guest_ip`: guest address with prefix (e.g. "10.0.0.2/24")
//! - `gateway_ip`: bridge address with prefix (e.g. "10.0.0.1/24")
//! - `entry_point`: optional command to launch once the guest is reachable

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{ChvError, Result};
use crate::network::Ipv4Cidr;

pub const KEY_VM_NAME: &str = "vm_name";
pub const KEY_GUEST_IP: &str = "guest_ip";
pub const KEY_GATEWAY_IP: &str = "gateway_ip";
pub const KEY_ENTRY_POINT: &str = "entry_point";

/// Longest accepted VM name (hostname label limit).
pub const MAX_VM_NAME_LEN: usize = 63;

/// Check that a VM name is usable as hostname, user name and sub-volume name.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_VM_NAME_LEN {
        return Err(ChvError::InvalidArgument(format!(
            "VM name must be 1-{} characters, got {}",
            MAX_VM_NAME_LEN,
            name.len()
        )));
    }
    let first = name.as_bytes()[0];
    if !first.is_ascii_alphanumeric() {
        return Err(ChvError::InvalidArgument(format!(
            "VM name '{}' must start with a letter or digit",
            name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == '.'))
    {
        return Err(ChvError::InvalidArgument(format!(
            "VM name '{}' contains invalid character '{}'",
            name, bad
        )));
    }
    Ok(())
}

/// Check that an entry point survives quoting on the kernel command line.
pub fn validate_entry_point(entry_point: &str) -> Result<()> {
    if entry_point.contains('"') || entry_point.contains('\n') {
        return Err(ChvError::InvalidArgument(
            "entry point must not contain quotes or newlines".to_string(),
        ));
    }
    Ok(())
}

/// Metadata the host hands to the guest at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootMetadata {
    pub vm_name: String,
    pub guest_ip: Ipv4Cidr,
    pub gateway_ip: Ipv4Cidr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

impl BootMetadata {
    pub fn new(
        vm_name: &str,
        guest_ip: Ipv4Cidr,
        gateway_ip: Ipv4Cidr,
        entry_point: Option<String>,
    ) -> Result<Self> {
        validate_vm_name(vm_name)?;
        if let Some(ep) = &entry_point {
            validate_entry_point(ep)?;
        }
        Ok(Self {
            vm_name: vm_name.to_string(),
            guest_ip,
            gateway_ip,
            entry_point: entry_point.filter(|ep| !ep.trim().is_empty()),
        })
    }

    /// Render the metadata as kernel command line tokens.
    pub fn to_kernel_args(&self) -> String {
        let mut args = format!(
            "{}=\"{}\" {}=\"{}\" {}=\"{}\"",
            KEY_VM_NAME,
            self.vm_name,
            KEY_GUEST_IP,
            self.guest_ip,
            KEY_GATEWAY_IP,
            self.gateway_ip
        );
        if let Some(ep) = &self.entry_point {
            args.push_str(&format!(" {}=\"{}\"", KEY_ENTRY_POINT, ep));
        }
        args
    }

    /// Full kernel command line: base arguments followed by the metadata.
    pub fn kernel_cmdline(&self, base_args: &str) -> String {
        let base = base_args.trim();
        if base.is_empty() {
            self.to_kernel_args()
        } else {
            format!("{} {}", base, self.to_kernel_args())
        }
    }

    /// Read every metadata key back from a kernel command line.
    pub fn from_cmdline(cmdline: &str) -> Result<Self> {
        let parsed = KernelCmdline::parse(cmdline)?;
        Ok(Self {
            vm_name: parsed.require(KEY_VM_NAME)?.to_string(),
            guest_ip: parsed.require_cidr(KEY_GUEST_IP)?,
            gateway_ip: parsed.require_cidr(KEY_GATEWAY_IP)?,
            entry_point: parsed.get(KEY_ENTRY_POINT).map(str::to_string),
        })
    }
}

/// A parsed kernel command line.
#[derive(Debug, Clone, Default)]
pub struct KernelCmdline {
    params: HashMap<String, String>,
}

impl KernelCmdline {
    /// Tokenize `key=value` / `key="value with spaces"` / bare `flag` items.
    ///
    /// A key only matches at a token boundary, so `xvm_name=` never satisfies
    /// a lookup of `vm_name`.
    pub fn parse(cmdline: &str) -> Result<Self> {
        let mut params = HashMap::new();
        let bytes = cmdline.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i >= bytes.len() {
                break;
            }

            let key_start = i;
            while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            let key = &cmdline[key_start..i];

            if i < bytes.len() && bytes[i] == b'=' {
                i += 1;
                let value = if i < bytes.len() && bytes[i] == b'"' {
                    i += 1;
                    let value_start = i;
                    while i < bytes.len() && bytes[i] != b'"' {
                        i += 1;
                    }
                    if i >= bytes.len() {
                        return Err(ChvError::MissingBootParameter(format!(
                            "unclosed quote for key {:?} in kernel command line",
                            key
                        )));
                    }
                    let value = &cmdline[value_start..i];
                    i += 1;
                    value
                } else {
                    let value_start = i;
                    while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                        i += 1;
                    }
                    &cmdline[value_start..i]
                };
                params.insert(key.to_string(), value.to_string());
            } else {
                params.insert(key.to_string(), String::new());
            }
        }

        Ok(Self { params })
    }

    /// Value for `key`, if present and non-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Value for `key`, or `MissingBootParameter`.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            ChvError::MissingBootParameter(format!("key {:?} not found in kernel command line", key))
        })
    }

    /// CIDR value for `key`.
    pub fn require_cidr(&self, key: &str) -> Result<Ipv4Cidr> {
        let raw = self.require(key)?;
        raw.parse().map_err(|e| {
            ChvError::MissingBootParameter(format!("failed to parse {}={:?}: {}", key, raw, e))
        })
    }

    /// Bare address for `key`; accepts either CIDR or plain form.
    pub fn require_address(&self, key: &str) -> Result<Ipv4Addr> {
        let raw = self.require(key)?;
        let addr = raw.split('/').next().unwrap_or(raw);
        addr.parse().map_err(|e| {
            ChvError::MissingBootParameter(format!("failed to parse {}={:?}: {}", key, raw, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> BootMetadata {
        BootMetadata::new(
            "vm1",
            "10.0.0.2/24".parse().unwrap(),
            "10.0.0.1/24".parse().unwrap(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_kernel_args_format() {
        assert_eq!(
            metadata().to_kernel_args(),
            r#"vm_name="vm1" guest_ip="10.0.0.2/24" gateway_ip="10.0.0.1/24""#
        );
    }

    #[test]
    fn test_kernel_cmdline_appends_to_base() {
        let cmdline = metadata().kernel_cmdline("console=ttyS0 root=/dev/vda rw ");
        assert!(cmdline.starts_with("console=ttyS0 root=/dev/vda rw vm_name="));
        assert_eq!(metadata().kernel_cmdline(""), metadata().to_kernel_args());
    }

    #[test]
    fn test_entry_point_is_quoted() {
        let meta = BootMetadata::new(
            "vm1",
            "10.0.0.2/24".parse().unwrap(),
            "10.0.0.1/24".parse().unwrap(),
            Some("/usr/bin/server --port 8080".to_string()),
        )
        .unwrap();
        let args = meta.to_kernel_args();
        assert!(args.ends_with(r#"entry_point="/usr/bin/server --port 8080""#));

        let back = BootMetadata::from_cmdline(&meta.kernel_cmdline("console=ttyS0")).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_blank_entry_point_dropped() {
        let meta = BootMetadata::new(
            "vm1",
            "10.0.0.2/24".parse().unwrap(),
            "10.0.0.1/24".parse().unwrap(),
            Some("  ".to_string()),
        )
        .unwrap();
        assert!(meta.entry_point.is_none());
    }

    #[test]
    fn test_entry_point_with_quote_rejected() {
        let result = BootMetadata::new(
            "vm1",
            "10.0.0.2/24".parse().unwrap(),
            "10.0.0.1/24".parse().unwrap(),
            Some("sh -c \"x\"".to_string()),
        );
        assert!(matches!(result, Err(ChvError::InvalidArgument(_))));
    }

    #[test]
    fn test_parse_real_cmdline() {
        let cmdline = "console=ttyS0 root=/dev/vda rw quiet vm_name=\"web\" \
                       guest_ip=\"10.20.1.7/24\" gateway_ip=\"10.20.1.1/24\"\n";
        let meta = BootMetadata::from_cmdline(cmdline).unwrap();
        assert_eq!(meta.vm_name, "web");
        assert_eq!(meta.guest_ip.to_string(), "10.20.1.7/24");
        assert_eq!(meta.gateway_ip.address(), Ipv4Addr::new(10, 20, 1, 1));
        assert!(meta.entry_point.is_none());
    }

    #[test]
    fn test_parse_unquoted_and_flags() {
        let parsed = KernelCmdline::parse("ro quiet vm_name=plain").unwrap();
        assert_eq!(parsed.get("vm_name"), Some("plain"));
        assert_eq!(parsed.get("quiet"), None);
    }

    #[test]
    fn test_key_must_match_token_boundary() {
        let parsed = KernelCmdline::parse(r#"xvm_name="imposter""#).unwrap();
        assert!(parsed.get("vm_name").is_none());
        assert!(matches!(
            parsed.require("vm_name"),
            Err(ChvError::MissingBootParameter(_))
        ));
    }

    #[test]
    fn test_unclosed_quote() {
        let result = KernelCmdline::parse(r#"vm_name="broken"#);
        assert!(matches!(result, Err(ChvError::MissingBootParameter(_))));
    }

    #[test]
    fn test_empty_value_is_missing() {
        let parsed = KernelCmdline::parse(r#"guest_ip="" gateway_ip="10.0.0.1/24""#).unwrap();
        assert!(parsed.require("guest_ip").is_err());
    }

    #[test]
    fn test_require_address_accepts_both_forms() {
        let parsed =
            KernelCmdline::parse(r#"gateway_ip="10.0.0.1/24" other="10.0.0.9""#).unwrap();
        assert_eq!(
            parsed.require_address("gateway_ip").unwrap(),
            Ipv4Addr::new(10, 0, 0, 1)
        );
        assert_eq!(
            parsed.require_address("other").unwrap(),
            Ipv4Addr::new(10, 0, 0, 9)
        );
    }

    #[test]
    fn test_validate_vm_name() {
        assert!(validate_vm_name("vm1").is_ok());
        assert!(validate_vm_name("web-01.prod_a").is_ok());
        assert!(validate_vm_name("").is_err());
        assert!(validate_vm_name("-leading").is_err());
        assert!(validate_vm_name("has space").is_err());
        assert!(validate_vm_name("quote\"d").is_err());
        assert!(validate_vm_name(&"a".repeat(64)).is_err());
    }
}
