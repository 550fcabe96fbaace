//! Driver configuration
//!
//! One explicit struct, loaded from JSON and handed to the driver's
//! constructor. Every field has a default so a config file only needs to
//! name what differs from a stock layout.

use crate::error::{ProvisionError, Result};
use crate::probe::ProbePolicy;
use crate::types::BootDevicePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default progress endpoint port
pub const DEFAULT_REPORT_PORT: u16 = 8089;

/// Reachability probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Remote-access port probed on the management IP
    pub port: u16,
    pub interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// `None` waits without a deadline
    pub deadline_secs: Option<u64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: 22,
            interval_secs: 3,
            connect_timeout_secs: 5,
            max_attempts: None,
            deadline_secs: None,
        }
    }
}

impl ProbeConfig {
    pub fn policy(&self) -> ProbePolicy {
        ProbePolicy {
            interval: Duration::from_secs(self.interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_attempts: self.max_attempts,
            deadline: self.deadline_secs.map(Duration::from_secs),
        }
    }
}

/// Commands the binary runs for power and boot-device control.
///
/// Each entry is an argv list; `{uuid}` is replaced with the node UUID.
/// An empty list means the action is only logged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementCommands {
    pub reboot: Vec<String>,
    pub power_off: Vec<String>,
    pub boot_pxe: Vec<String>,
    pub boot_disk: Vec<String>,
}

/// Configuration of the PXE auto-deploy driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Address of this conductor as seen by booting nodes
    pub my_ip: String,
    /// Boot-loader config template
    pub boot_config_template: PathBuf,
    /// Installer-answer template
    pub answer_template: PathBuf,
    /// Repository server providing the distribution packages
    pub repo_server: String,
    /// Boot-config root served over TFTP
    pub tftp_root: PathBuf,
    /// Installer-answer root served over HTTP
    pub answer_root: PathBuf,
    /// iPXE looks configs up by bare MAC; PXELINUX wants a hardware-type prefix
    pub ipxe_enabled: bool,
    pub hostname_prefix: String,
    pub boot_device_policy: BootDevicePolicy,
    pub probe: ProbeConfig,
    /// Port the progress endpoint listens on and installers report to
    pub report_port: u16,
    /// Shared secret progress reports must carry; `serve` refuses to run without one
    pub report_token: Option<String>,
    pub management_commands: ManagementCommands,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            my_ip: "127.0.0.1".to_string(),
            boot_config_template: PathBuf::from("templates/pxe_config.template"),
            answer_template: PathBuf::from("templates/auto.template"),
            repo_server: "127.0.0.1".to_string(),
            tftp_root: PathBuf::from("/tftpboot"),
            answer_root: PathBuf::from("/var/www/html/auto"),
            ipxe_enabled: false,
            hostname_prefix: "Host-".to_string(),
            boot_device_policy: BootDevicePolicy::FailOpen,
            probe: ProbeConfig::default(),
            report_port: DEFAULT_REPORT_PORT,
            report_token: None,
            management_commands: ManagementCommands::default(),
        }
    }
}

impl DeployConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|e| ProvisionError::io(path.as_ref(), e))
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(&path).map_err(|e| ProvisionError::io(path.as_ref(), e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ProvisionError::config(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(config)
    }

    /// Whether MAC link names carry the `01-`/`20-` hardware-type prefix
    pub fn hw_type_prefix(&self) -> bool {
        !self.ipxe_enabled
    }

    /// Address the progress endpoint binds when none is given
    pub fn default_listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.report_port)
    }

    /// The report token, which must be set before reports are accepted
    pub fn require_report_token(&self) -> Result<&str> {
        self.report_token.as_deref().ok_or_else(|| {
            ProvisionError::config("report_token must be set to accept progress reports")
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.boot_config_template.as_os_str().is_empty() {
            return Err(ProvisionError::config("boot_config_template must be set"));
        }
        if self.answer_template.as_os_str().is_empty() {
            return Err(ProvisionError::config("answer_template must be set"));
        }

        for (name, value) in [("my_ip", &self.my_ip), ("repo_server", &self.repo_server)] {
            if value.parse::<IpAddr>().is_err() {
                return Err(ProvisionError::config(format!(
                    "{} must be an IP address, got {:?}",
                    name, value
                )));
            }
        }

        if self.tftp_root.as_os_str().is_empty() || self.answer_root.as_os_str().is_empty() {
            return Err(ProvisionError::config(
                "tftp_root and answer_root must both be set",
            ));
        }
        if self.tftp_root == self.answer_root {
            return Err(ProvisionError::config(
                "tftp_root and answer_root must be different directories",
            ));
        }

        if self.probe.interval_secs == 0 {
            return Err(ProvisionError::config("probe.interval_secs must be at least 1"));
        }
        if self.probe.max_attempts == Some(0) {
            return Err(ProvisionError::config("probe.max_attempts must be at least 1"));
        }

        if self.report_port == 0 {
            return Err(ProvisionError::config("report_port must not be 0"));
        }
        if let Some(token) = self.report_token.as_deref() {
            if token.is_empty() {
                return Err(ProvisionError::config("report_token must not be blank"));
            }
            // The token is spliced into a shell line and a JSON string
            if !token.bytes().all(is_token_byte) {
                return Err(ProvisionError::config(
                    "report_token may only contain ASCII letters, digits, '-', '_' and '.'",
                ));
            }
        }

        Ok(())
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let config = DeployConfig::default();
        config.validate().expect("default config should validate");
        assert!(config.hw_type_prefix());
        assert_eq!(config.probe.port, 22);
        assert_eq!(config.probe.interval_secs, 3);
        assert_eq!(config.probe.max_attempts, None);
        assert_eq!(config.report_port, DEFAULT_REPORT_PORT);
        assert_eq!(config.default_listen_addr(), "0.0.0.0:8089");
    }

    #[test]
    fn test_report_token_required_to_accept_reports() {
        let err = DeployConfig::default().require_report_token().unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));

        let config = DeployConfig {
            report_token: Some("s3cret".to_string()),
            ..Default::default()
        };
        assert_eq!(config.require_report_token().expect("token"), "s3cret");
    }

    #[test]
    fn test_report_token_charset() {
        for good in ["s3cret", "a-b_c.D9"] {
            let config = DeployConfig {
                report_token: Some(good.to_string()),
                ..Default::default()
            };
            config.validate().expect(good);
        }
        for bad in ["", "  ", "100%", "it's", "two words", "a\"b", "x;y"] {
            let config = DeployConfig {
                report_token: Some(bad.to_string()),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_custom_report_port() {
        let config: DeployConfig =
            serde_json::from_str(r#"{"report_port": 9100}"#).expect("parse");
        assert_eq!(config.default_listen_addr(), "0.0.0.0:9100");

        let zero = DeployConfig {
            report_port: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: DeployConfig =
            serde_json::from_str(r#"{"my_ip": "10.0.0.1", "ipxe_enabled": true, "probe": {"max_attempts": 40}}"#)
                .expect("parse");
        assert_eq!(config.my_ip, "10.0.0.1");
        assert!(!config.hw_type_prefix());
        assert_eq!(config.probe.max_attempts, Some(40));
        assert_eq!(config.probe.port, 22);
        assert_eq!(config.hostname_prefix, "Host-");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let mut config = DeployConfig::default();
        config.report_token = Some("s3cret".to_string());
        config.boot_device_policy = BootDevicePolicy::FailClosed;

        let temp_file = NamedTempFile::new().expect("temp file");
        config.save_to_file(temp_file.path()).expect("save");
        let loaded = DeployConfig::load_from_file(temp_file.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_ip = DeployConfig {
            my_ip: "conductor".to_string(),
            ..Default::default()
        };
        assert!(bad_ip.validate().is_err());

        let same_roots = DeployConfig {
            answer_root: PathBuf::from("/tftpboot"),
            ..Default::default()
        };
        assert!(same_roots.validate().is_err());

        let mut zero_interval = DeployConfig::default();
        zero_interval.probe.interval_secs = 0;
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn test_probe_policy_conversion() {
        let probe = ProbeConfig {
            max_attempts: Some(5),
            deadline_secs: Some(600),
            ..Default::default()
        };
        let policy = probe.policy();
        assert_eq!(policy.interval, Duration::from_secs(3));
        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.deadline, Some(Duration::from_secs(600)));
    }
}
