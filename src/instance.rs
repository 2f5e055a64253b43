//! Read-only view of a virtual machine instance.
//!
//! Instances are owned by the cluster datastore; the tunnel only inspects the
//! device configuration (to validate a request) and the status (to decide
//! whether the instance can serve it and where it runs). Field names follow
//! the datastore's camelCase JSON.

use serde::{Deserialize, Serialize};

/// A running (or scheduled) virtual machine, identified by namespace + name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub devices: Devices,
}

/// Attached device configuration. `None` means "platform default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Graphics device; attached unless explicitly `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoattach_graphics_device: Option<bool>,
    /// Serial console; attached unless explicitly `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoattach_serial_console: Option<bool>,
    /// VSOCK device; only attached when explicitly `true`.
    #[serde(default, rename = "autoattachVSOCK", skip_serializing_if = "Option::is_none")]
    pub autoattach_vsock: Option<bool>,
    /// USB client passthrough (redirection) configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_passthrough: Option<ClientPassthrough>,
}

/// Marker for a configured USB-redirection channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientPassthrough {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Compute node currently hosting the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

/// Condition type set while the instance is paused.
pub const PAUSED_CONDITION: &str = "Paused";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

impl InterfaceStatus {
    /// Primary address, falling back to the first of the reported list.
    pub fn address(&self) -> Option<&str> {
        self.ip_address
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.ip_addresses.first().map(String::as_str))
    }
}

impl Instance {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            spec: InstanceSpec::default(),
            status: InstanceStatus::default(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.status.phase = phase;
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.status.node_name = Some(node.into());
        self
    }

    pub fn with_interface_ip(mut self, ip: impl Into<String>) -> Self {
        self.status.interfaces.push(InterfaceStatus {
            name: None,
            ip_address: Some(ip.into()),
            ip_addresses: Vec::new(),
        });
        self
    }

    pub fn with_condition(mut self, condition_type: &str, status: bool) -> Self {
        self.status.conditions.push(Condition {
            condition_type: condition_type.to_owned(),
            status: if status { "True" } else { "False" }.to_owned(),
        });
        self
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == Phase::Running
    }

    pub fn is_failed(&self) -> bool {
        self.status.phase == Phase::Failed
    }

    pub fn is_paused(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.condition_type == PAUSED_CONDITION && c.status == "True")
    }

    pub fn has_graphics_device(&self) -> bool {
        self.spec.devices.autoattach_graphics_device != Some(false)
    }

    pub fn has_serial_console(&self) -> bool {
        self.spec.devices.autoattach_serial_console != Some(false)
    }

    pub fn has_vsock(&self) -> bool {
        self.spec.devices.autoattach_vsock == Some(true)
    }

    pub fn has_usb_redirection(&self) -> bool {
        self.spec.devices.client_passthrough.is_some()
    }

    /// Address of the first reported network interface, if any.
    pub fn first_interface_address(&self) -> Option<&str> {
        self.status.interfaces.first().and_then(InterfaceStatus::address)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_defaults() {
        let vmi = Instance::new("default", "testvmi");
        assert!(vmi.has_graphics_device());
        assert!(vmi.has_serial_console());
        assert!(!vmi.has_vsock());
        assert!(!vmi.has_usb_redirection());
    }

    #[test]
    fn paused_condition_must_be_true() {
        let vmi = Instance::new("default", "testvmi").with_condition(PAUSED_CONDITION, false);
        assert!(!vmi.is_paused());

        let vmi = vmi.with_condition(PAUSED_CONDITION, true);
        assert!(vmi.is_paused());
    }

    #[test]
    fn parses_datastore_json() {
        let json = r#"{
            "namespace": "default",
            "name": "testvmi",
            "spec": { "devices": { "autoattachGraphicsDevice": false, "autoattachVSOCK": true, "clientPassthrough": {} } },
            "status": {
                "phase": "Running",
                "nodeName": "node01",
                "conditions": [ { "type": "Paused", "status": "True" } ],
                "interfaces": [ { "name": "default", "ipAddresses": ["10.0.2.2"] } ]
            }
        }"#;

        let vmi: Instance = serde_json::from_str(json).unwrap();
        assert!(vmi.is_running());
        assert!(vmi.is_paused());
        assert!(!vmi.has_graphics_device());
        assert!(vmi.has_vsock());
        assert!(vmi.has_usb_redirection());
        assert_eq!(vmi.status.node_name.as_deref(), Some("node01"));
        assert_eq!(vmi.first_interface_address(), Some("10.0.2.2"));
    }

    #[test]
    fn first_interface_address_prefers_primary_ip() {
        let mut vmi = Instance::new("default", "testvmi");
        vmi.status.interfaces.push(InterfaceStatus {
            name: Some("default".into()),
            ip_address: Some("10.0.0.1".into()),
            ip_addresses: vec!["10.0.0.2".into()],
        });
        assert_eq!(vmi.first_interface_address(), Some("10.0.0.1"));
    }
}
