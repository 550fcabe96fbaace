//! Filesystem-backed artifact store
//!
//! Holds the two per-node artifacts a PXE auto-install needs:
//!
//! - the boot config, at `<tftp_root>/<node-uuid>/config`
//! - the installer-answer file, at `<answer_root>/<node-uuid>_auto.cfg`
//!
//! Writes are atomic: content goes to a temporary file in the destination
//! directory which is then renamed over the target, so a TFTP or HTTP
//! server never serves a half-written file. Deletes treat absence as
//! success. Nothing here retries; the caller decides.

use crate::error::{ProvisionError, Result};
use std::fs::{self, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// File name of the boot config inside the per-node directory.
pub const BOOT_CONFIG_FILE_NAME: &str = "config";

/// Mode of written artifacts; TFTP and HTTP daemons read them as other users.
pub const ARTIFACT_MODE: u32 = 0o644;

/// Suffix appended to the node UUID for installer-answer files.
pub const ANSWER_FILE_SUFFIX: &str = "_auto.cfg";

/// Artifact store rooted at the boot-config and installer-answer roots.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    tftp_root: PathBuf,
    answer_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(tftp_root: impl Into<PathBuf>, answer_root: impl Into<PathBuf>) -> Self {
        Self {
            tftp_root: tftp_root.into(),
            answer_root: answer_root.into(),
        }
    }

    pub fn tftp_root(&self) -> &Path {
        &self.tftp_root
    }

    pub fn answer_root(&self) -> &Path {
        &self.answer_root
    }

    /// `<tftp_root>/<uuid>`
    pub fn boot_config_dir(&self, node: &Uuid) -> PathBuf {
        self.tftp_root.join(node.to_string())
    }

    /// `<tftp_root>/<uuid>/config`
    pub fn boot_config_path(&self, node: &Uuid) -> PathBuf {
        self.boot_config_dir(node).join(BOOT_CONFIG_FILE_NAME)
    }

    /// `<answer_root>/<uuid>_auto.cfg`
    pub fn answer_path(&self, node: &Uuid) -> PathBuf {
        self.answer_root
            .join(format!("{}{}", node, ANSWER_FILE_SUFFIX))
    }

    /// Create `dir` and any missing parents.
    pub fn ensure_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| ProvisionError::io(dir, e))
    }

    /// Atomically replace the file at `path` with `content`.
    pub fn write_artifact(&self, path: &Path, content: &str) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.ensure_dir(parent)?;

        let mut staged =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| ProvisionError::io(parent, e))?;
        staged
            .write_all(content.as_bytes())
            .and_then(|()| {
                staged
                    .as_file()
                    .set_permissions(Permissions::from_mode(ARTIFACT_MODE))
            })
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|e| ProvisionError::io(staged.path(), e))?;
        staged
            .persist(path)
            .map_err(|e| ProvisionError::io(path, e.error))?;

        debug!(path = %path.display(), bytes = content.len(), "Wrote artifact");
        Ok(())
    }

    /// Remove the file at `path`. Returns false if it did not exist.
    pub fn delete_artifact(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted artifact");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProvisionError::io(path, e)),
        }
    }

    /// Remove the directory tree at `dir`. Returns false if it did not exist.
    pub fn delete_tree(&self, dir: &Path) -> Result<bool> {
        match fs::remove_dir_all(dir) {
            Ok(()) => {
                debug!(path = %dir.display(), "Deleted artifact directory");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProvisionError::io(dir, e)),
        }
    }
}
