//! Type-safe vocabulary shared by the deploy driver and its collaborators
//!
//! Stringly-typed driver arguments (`'reboot'`, `'pxe'`, `'done'`) are
//! modelled as enums that provide compile-time validation and exhaustive
//! matching.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Device the node should boot from on its next power cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    /// Network boot through the PXE/iPXE firmware
    Pxe,
    /// Local disk (the freshly installed OS)
    Disk,
}

/// Power transition requested from the power collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    #[strum(serialize = "reboot")]
    Reboot,
    #[strum(serialize = "power off")]
    PowerOff,
}

/// Provision-state events fired at the externally tracked node state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProvisionEvent {
    /// Installer passed the resume threshold
    Resume,
    /// Deployed OS confirmed reachable
    Done,
}

/// What to do when the boot-device collaborator fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum BootDevicePolicy {
    /// Log the failure and continue
    #[default]
    FailOpen,
    /// Propagate the failure to the caller
    FailClosed,
}

impl BootDevicePolicy {
    /// Returns true if boot-device failures abort the operation
    pub fn is_strict(self) -> bool {
        matches!(self, Self::FailClosed)
    }
}

/// Link layer of a port, decided by the presence of a client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumIter)]
pub enum PortKind {
    #[strum(serialize = "ethernet")]
    Ethernet,
    #[strum(serialize = "infiniband")]
    Infiniband,
}

impl PortKind {
    /// Classify a port from its optional client identifier
    pub fn from_client_id(client_id: Option<&str>) -> Self {
        match client_id {
            Some(id) if !id.is_empty() => Self::Infiniband,
            _ => Self::Ethernet,
        }
    }

    /// PXELINUX hardware-type prefix for this link layer
    pub const fn hw_type_prefix(self) -> &'static str {
        match self {
            Self::Ethernet => "01-",
            Self::Infiniband => "20-",
        }
    }
}

/// Status returned by `deploy`: the reboot was requested, progress follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display)]
pub enum DeployStatus {
    #[strum(serialize = "deploy wait")]
    DeployWait,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_boot_device_roundtrip() {
        for device in BootDevice::iter() {
            let parsed: BootDevice = device.to_string().parse().expect("Should parse");
            assert_eq!(parsed, device);
        }
        assert_eq!(BootDevice::Pxe.to_string(), "pxe");
    }

    #[test]
    fn test_power_action_display() {
        assert_eq!(PowerAction::Reboot.to_string(), "reboot");
        assert_eq!(PowerAction::PowerOff.to_string(), "power off");
    }

    #[test]
    fn test_policy_default_is_fail_open() {
        assert_eq!(BootDevicePolicy::default(), BootDevicePolicy::FailOpen);
        assert!(!BootDevicePolicy::FailOpen.is_strict());
        assert!(BootDevicePolicy::FailClosed.is_strict());
        let parsed: BootDevicePolicy = "fail-closed".parse().expect("Should parse");
        assert_eq!(parsed, BootDevicePolicy::FailClosed);
    }

    #[test]
    fn test_port_kind_from_client_id() {
        assert_eq!(PortKind::from_client_id(None), PortKind::Ethernet);
        assert_eq!(PortKind::from_client_id(Some("")), PortKind::Ethernet);
        assert_eq!(
            PortKind::from_client_id(Some("ff:00:00:00:00:00:02:00:00:02:c9:00")),
            PortKind::Infiniband
        );
        assert_eq!(PortKind::Ethernet.hw_type_prefix(), "01-");
        assert_eq!(PortKind::Infiniband.hw_type_prefix(), "20-");
    }
}
