//! Node and port snapshots
//!
//! The node-persistence layer owns these records. The driver receives
//! read-only value snapshots per call and returns anything it derives
//! (for example the resolved boot-interface MAC) instead of writing it
//! back into shared metadata.

use crate::error::{ProvisionError, Result};
use crate::mac::{MacAddress, mac_from_pxe_interface, parse_mac};
use crate::types::PortKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Instance parameters that must be present before `prepare`.
pub const REQUIRED_PROPERTIES: [&str; 5] = [
    "user_kernel",
    "user_ramdisk",
    "management_ip",
    "management_netmask",
    "management_gateway",
];

/// Per-deployment parameters supplied by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Kernel image, relative to the boot-config root
    #[serde(default)]
    pub user_kernel: Option<String>,
    /// Ramdisk image, relative to the boot-config root
    #[serde(default)]
    pub user_ramdisk: Option<String>,
    #[serde(default)]
    pub management_ip: Option<String>,
    #[serde(default)]
    pub management_netmask: Option<String>,
    #[serde(default)]
    pub management_gateway: Option<String>,
    /// OS release the installer should lay down
    #[serde(default)]
    pub os_ver: Option<String>,
}

impl InstanceInfo {
    /// Look up a parameter by its instance-info key.
    ///
    /// Empty strings count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        let value = match key {
            "user_kernel" => &self.user_kernel,
            "user_ramdisk" => &self.user_ramdisk,
            "management_ip" => &self.management_ip,
            "management_netmask" => &self.management_netmask,
            "management_gateway" => &self.management_gateway,
            "os_ver" => &self.os_ver,
            _ => return None,
        };
        value.as_deref().filter(|v| !v.trim().is_empty())
    }

    /// Like `get`, but a missing key is a `MissingParameterValue` error.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| ProvisionError::missing(key))
    }

    /// First required key that is absent, in declaration order
    pub fn first_missing(&self) -> Option<&'static str> {
        REQUIRED_PROPERTIES
            .iter()
            .copied()
            .find(|key| self.get(key).is_none())
    }
}

/// One interface found during inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDetail {
    /// Interface name as the installer will see it (e.g. `eth0`)
    pub name: String,
    pub mac_address: String,
}

/// Boot facts recorded by inspection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootDetail {
    /// PXELINUX-style interface id, e.g. `01-6c-92-bf-0c-9c-d9`
    #[serde(default)]
    pub pxe_interface: Option<String>,
}

/// Inspection metadata attached to a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExtra {
    #[serde(default)]
    pub boot_detailed: Option<BootDetail>,
    #[serde(default)]
    pub nic_detailed: Vec<NicDetail>,
}

/// Snapshot of a node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: Uuid,
    #[serde(default)]
    pub instance_info: InstanceInfo,
    #[serde(default)]
    pub extra: NodeExtra,
}

impl Node {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            instance_info: InstanceInfo::default(),
            extra: NodeExtra::default(),
        }
    }

    /// Load a node snapshot from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(&path).map_err(|e| ProvisionError::io(path.as_ref(), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Boot-interface MAC from inspection data.
    pub fn boot_interface_mac(&self) -> Result<MacAddress> {
        let pxe_interface = self
            .extra
            .boot_detailed
            .as_ref()
            .and_then(|b| b.pxe_interface.as_deref())
            .ok_or_else(|| ProvisionError::missing("extra.boot_detailed.pxe_interface"))?;
        mac_from_pxe_interface(pxe_interface)
    }

    /// Name of the discovered interface whose address is `mac`.
    ///
    /// Entries with unparsable addresses are skipped.
    pub fn interface_name_for(&self, mac: &MacAddress) -> Option<&str> {
        self.extra
            .nic_detailed
            .iter()
            .find(|nic| parse_mac(&nic.mac_address).ok().as_ref() == Some(mac))
            .map(|nic| nic.name.as_str())
    }
}

/// Per-port metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortExtra {
    /// DHCP client identifier; present only on InfiniBand ports
    #[serde(default, rename = "client-id")]
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Snapshot of a port record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub address: String,
    #[serde(default)]
    pub extra: PortExtra,
}

impl Port {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            extra: PortExtra::default(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.extra.client_id = Some(client_id.into());
        self
    }

    pub fn kind(&self) -> PortKind {
        PortKind::from_client_id(self.extra.client_id.as_deref())
    }

    pub fn mac(&self) -> Result<MacAddress> {
        parse_mac(&self.address)
    }

    /// Load a port list from a JSON file
    pub fn load_all_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let content =
            fs::read_to_string(&path).map_err(|e| ProvisionError::io(path.as_ref(), e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// The single port whose address is the boot-interface MAC.
pub fn find_boot_port<'a>(ports: &'a [Port], boot_mac: &MacAddress) -> Option<&'a Port> {
    ports
        .iter()
        .find(|port| port.mac().ok().as_ref() == Some(boot_mac))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspected_node() -> Node {
        let mut node = Node::new(Uuid::nil());
        node.extra.boot_detailed = Some(BootDetail {
            pxe_interface: Some("01-aa-bb-cc-dd-ee-ff".to_string()),
        });
        node.extra.nic_detailed = vec![
            NicDetail {
                name: "eth0".to_string(),
                mac_address: "11:22:33:44:55:66".to_string(),
            },
            NicDetail {
                name: "eth1".to_string(),
                mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            },
        ];
        node
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let info = InstanceInfo {
            user_kernel: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(info.get("user_kernel"), None);
        assert_eq!(info.first_missing(), Some("user_kernel"));
        assert!(info.require("management_ip").is_err());
    }

    #[test]
    fn test_boot_interface_and_management_port() {
        let node = inspected_node();
        let mac = node.boot_interface_mac().expect("boot mac");
        assert_eq!(mac, MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
        assert_eq!(node.interface_name_for(&mac), Some("eth1"));
    }

    #[test]
    fn test_boot_interface_missing_inspection_data() {
        let node = Node::new(Uuid::nil());
        let err = node.boot_interface_mac().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_find_boot_port() {
        let ports = vec![
            Port::new("11:22:33:44:55:66"),
            Port::new("aa:bb:cc:dd:ee:ff").with_client_id("ff:00:01"),
        ];
        let mac = parse_mac("aa:bb:cc:dd:ee:ff").expect("mac");
        let port = find_boot_port(&ports, &mac).expect("found");
        assert_eq!(port.kind(), PortKind::Infiniband);

        let other = parse_mac("00:00:00:00:00:01").expect("mac");
        assert!(find_boot_port(&ports, &other).is_none());
    }

    #[test]
    fn test_port_json_client_id_key() {
        let port: Port = serde_json::from_str(
            r#"{"address": "aa:bb:cc:dd:ee:ff", "extra": {"client-id": "ff:00", "vif": "x"}}"#,
        )
        .expect("parse");
        assert_eq!(port.extra.client_id.as_deref(), Some("ff:00"));
        assert!(port.extra.other.contains_key("vif"));
    }
}
