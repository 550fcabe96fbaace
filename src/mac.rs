//! MAC link management
//!
//! A generic PXE server knows nothing about node UUIDs; it looks up
//! `pxelinux.cfg/<hardware-address>` instead. This module computes those
//! file names and maintains the symbolic links that point each boot
//! interface at its node's boot config.
//!
//! # Link layout
//!
//! ```text
//! <tftp_root>/
//!     <node-uuid>/config                  boot config (artifact store)
//!     pxelinux.cfg/01-aa-bb-cc-dd-ee-ff -> ../<node-uuid>/config
//! ```
//!
//! Links are relative so the whole tree can be moved or served from a
//! different mount point.

use crate::error::{ProvisionError, Result};
use crate::types::PortKind;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

pub use mac_address::MacAddress;

/// Directory (under the boot-config root) the PXE server searches by MAC.
pub const PXE_CFG_DIR_NAME: &str = "pxelinux.cfg";

/// Parse a hardware address written with `:` or `-` separators, any case.
pub fn parse_mac(s: &str) -> Result<MacAddress> {
    s.trim()
        .parse()
        .map_err(|e| ProvisionError::InvalidMac(format!("{}: {}", s, e)))
}

/// Lowercase octets joined by hyphens, the way PXELINUX spells them.
pub fn hyphenated(mac: &MacAddress) -> String {
    mac.bytes()
        .iter()
        .map(|octet| format!("{:02x}", octet))
        .collect::<Vec<_>>()
        .join("-")
}

/// Derive the boot-interface MAC from inspection data.
///
/// Inspection stores the PXE interface the way PXELINUX names it,
/// e.g. `01-6c-92-bf-0c-9c-d9`; the leading hardware-type prefix is
/// three characters wide and is dropped.
pub fn mac_from_pxe_interface(pxe_interface: &str) -> Result<MacAddress> {
    let bare = pxe_interface
        .get(3..)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| ProvisionError::InvalidMac(pxe_interface.to_string()))?;
    parse_mac(bare)
}

/// File name the PXE server expects for `mac`.
///
/// With hardware-type prefixing (plain PXELINUX, i.e. iPXE disabled) the
/// name carries `01-` for Ethernet or `20-` for InfiniBand.
pub fn mac_config_file_name(mac: &MacAddress, hw_type_prefix: bool, kind: PortKind) -> String {
    let name = hyphenated(mac);
    if hw_type_prefix {
        format!("{}{}", kind.hw_type_prefix(), name)
    } else {
        name
    }
}

/// Path of `target` expressed relative to the directory `base`.
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<Component<'_>> = target.components().collect();
    let base: Vec<Component<'_>> = base.components().collect();
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for component in &target[common..] {
        rel.push(component.as_os_str());
    }
    rel
}

/// Maintains `pxelinux.cfg/<mac>` links under a boot-config root.
#[derive(Debug, Clone)]
pub struct MacLinker {
    tftp_root: PathBuf,
    hw_type_prefix: bool,
}

impl MacLinker {
    /// `hw_type_prefix` is true unless the deployment boots through iPXE.
    pub fn new(tftp_root: impl Into<PathBuf>, hw_type_prefix: bool) -> Self {
        Self {
            tftp_root: tftp_root.into(),
            hw_type_prefix,
        }
    }

    pub fn pxe_cfg_dir(&self) -> PathBuf {
        self.tftp_root.join(PXE_CFG_DIR_NAME)
    }

    /// Full path of the link for `mac`
    pub fn mac_config_path(&self, mac: &MacAddress, kind: PortKind) -> PathBuf {
        self.pxe_cfg_dir()
            .join(mac_config_file_name(mac, self.hw_type_prefix, kind))
    }

    /// Point the link for `mac` at `target`, replacing whatever was there.
    ///
    /// The new link is created under a temporary name and renamed into
    /// place, so a failure never leaves a half-made link at the real path.
    pub fn link(&self, mac: &MacAddress, kind: PortKind, target: &Path) -> Result<PathBuf> {
        let link_path = self.mac_config_path(mac, kind);
        let link_dir = self.pxe_cfg_dir();

        remove_if_present(&link_path)?;

        let relative = relative_path(target, &link_dir);
        let staging = link_dir.join(format!(
            ".{}.{}.tmp",
            mac_config_file_name(mac, self.hw_type_prefix, kind),
            std::process::id()
        ));
        remove_if_present(&staging)?;

        std::os::unix::fs::symlink(&relative, &staging)
            .map_err(|e| ProvisionError::io(&staging, e))?;
        if let Err(e) = fs::rename(&staging, &link_path) {
            let _ = fs::remove_file(&staging);
            return Err(ProvisionError::io(&link_path, e));
        }

        info!(
            mac = %mac,
            link = %link_path.display(),
            target = %relative.display(),
            "Linked MAC to boot config"
        );
        Ok(link_path)
    }

    /// Remove the link for `mac`. Returns false if there was nothing to remove.
    pub fn unlink(&self, mac: &MacAddress, kind: PortKind) -> Result<bool> {
        let link_path = self.mac_config_path(mac, kind);
        let removed = remove_if_present(&link_path)?;
        if removed {
            debug!(mac = %mac, link = %link_path.display(), "Removed MAC link");
        }
        Ok(removed)
    }
}

/// Remove a file or symlink, treating absence as success.
fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ProvisionError::io(path, e)),
    }
}
