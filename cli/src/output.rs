//! Table and JSON formatting for command output.

use chrono::{DateTime, Utc};
use chv_core::api::VmInfo;
use comfy_table::{ContentArrangement, Table};
use serde::Serialize;

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// One row per VM, in the order given.
pub fn vm_table(vms: &[VmInfo]) -> Table {
    let mut table = new_table(&["NAME", "STATE", "IP", "TAP", "ENTRY POINT", "CREATED"]);
    for vm in vms {
        table.add_row(vec![
            vm.name.clone(),
            vm.state.to_string(),
            vm.ip.to_string(),
            vm.tap.clone(),
            vm.entry_point.clone().unwrap_or_else(|| "-".to_string()),
            format_ago(&vm.created_at),
        ]);
    }
    table
}

/// Pretty-printed JSON.
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}

/// Format a timestamp relative to now, e.g. "5 minutes ago".
pub fn format_ago(dt: &DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 1 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    format!("{} days ago", duration.num_days())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use chv_core::api::VmState;

    fn vm(name: &str, ip: &str) -> VmInfo {
        VmInfo {
            name: name.to_string(),
            state: VmState::Running,
            ip: ip.parse().unwrap(),
            kernel: None,
            rootfs: None,
            entry_point: None,
            snapshot: None,
            tap: "tap0a140102".to_string(),
            created_at: Utc::now() - Duration::minutes(3),
        }
    }

    #[test]
    fn test_format_ago() {
        let now = Utc::now();
        assert_eq!(format_ago(&(now + Duration::seconds(5))), "just now");
        assert_eq!(format_ago(&(now - Duration::seconds(30))), "30 seconds ago");
        assert_eq!(format_ago(&(now - Duration::minutes(5))), "5 minutes ago");
        assert_eq!(format_ago(&(now - Duration::hours(2))), "2 hours ago");
        assert_eq!(format_ago(&(now - Duration::days(3))), "3 days ago");
    }

    #[test]
    fn test_vm_table() {
        let rendered = vm_table(&[vm("vm1", "10.20.1.2/24"), vm("vm2", "10.20.1.3/24")]).to_string();

        assert!(rendered.contains("NAME"));
        assert!(rendered.contains("vm1"));
        assert!(rendered.contains("10.20.1.3/24"));
        assert!(rendered.contains("running"));
        assert!(rendered.contains("3 minutes ago"));
        assert!(rendered.find("vm1").unwrap() < rendered.find("vm2").unwrap());
    }

    #[test]
    fn test_vm_table_empty() {
        let rendered = vm_table(&[]).to_string();
        assert!(rendered.contains("STATE"));
        assert!(!rendered.contains("running"));
    }
}
