//! Template rendering for boot configs and installer-answer files
//!
//! Templates are Jinja files on disk, loaded through a minijinja
//! `path_loader` rooted at the template's own directory. Undefined
//! variables are an error rather than an empty string, so a template that
//! references a field the driver did not supply fails loudly instead of
//! producing a broken install.

use crate::error::{ProvisionError, Result};
use minijinja::{Environment, UndefinedBehavior, path_loader};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Variables available to the boot-config template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootConfigContext {
    /// Kernel image path as seen by the TFTP server
    pub kernel: String,
    /// Ramdisk image path as seen by the TFTP server
    pub ramdisk: String,
    pub server_ip: String,
    pub node_uuid: String,
}

/// Variables available to the installer-answer template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnswerContext {
    pub management_ip: String,
    pub management_netmask: String,
    pub management_gateway: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    pub server_ip: String,
    /// Port of the progress endpoint on `server_ip`
    pub report_port: u16,
    pub repo_server_ip: String,
    pub node_uuid: String,
    /// Interface carrying the boot MAC; left undefined when inspection
    /// did not report it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management_port: Option<String>,
    /// Shared secret the installer presents with progress reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_token: Option<String>,
}

/// Hostname for a node: `prefix` followed by its IP with dots as hyphens.
pub fn derive_hostname(prefix: &str, management_ip: &str) -> String {
    format!("{}{}", prefix, management_ip.replace('.', "-"))
}

/// Renders named template files against a serializable context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Load the template at `template_path` and render it with `context`.
    pub fn render<C: Serialize>(&self, template_path: &Path, context: &C) -> Result<String> {
        let name = template_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ProvisionError::template(format!(
                    "{} does not name a template file",
                    template_path.display()
                ))
            })?;
        if !template_path.is_file() {
            return Err(ProvisionError::template(format!(
                "template {} does not exist",
                template_path.display()
            )));
        }
        let dir = template_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut env = Environment::new();
        env.set_loader(path_loader(dir));
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        let rendered = env.get_template(name)?.render(context)?;
        debug!(template = %template_path.display(), bytes = rendered.len(), "Rendered template");
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn boot_context() -> BootConfigContext {
        BootConfigContext {
            kernel: "/tftpboot/images/vmlinuz".to_string(),
            ramdisk: "/tftpboot/images/initrd.img".to_string(),
            server_ip: "10.0.0.1".to_string(),
            node_uuid: "abc-123".to_string(),
        }
    }

    #[test]
    fn test_hostname_derivation() {
        assert_eq!(derive_hostname("Host-", "192.168.1.20"), "Host-192-168-1-20");
    }

    #[test]
    fn test_render_substitutes_fields() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("pxe.template");
        fs::write(
            &path,
            "kernel {{ kernel }}\nappend initrd={{ ramdisk }} ks=http://{{ server_ip }}/{{ node_uuid }}\n",
        )
        .expect("write template");

        let out = TemplateRenderer::new()
            .render(&path, &boot_context())
            .expect("render");
        assert_eq!(
            out,
            "kernel /tftpboot/images/vmlinuz\nappend initrd=/tftpboot/images/initrd.img ks=http://10.0.0.1/abc-123\n"
        );
    }

    #[test]
    fn test_missing_template_is_template_error() {
        let dir = TempDir::new().expect("tempdir");
        let err = TemplateRenderer::new()
            .render(&dir.path().join("nope.template"), &boot_context())
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Template(_)));
    }

    #[test]
    fn test_undefined_field_is_template_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("pxe.template");
        fs::write(&path, "kernel {{ kernel }} {{ no_such_field }}\n").expect("write");

        let err = TemplateRenderer::new()
            .render(&path, &boot_context())
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Template(_)));
    }

    #[test]
    fn test_absent_management_port_is_undefined() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("auto.template");
        fs::write(&path, "{{ management_port }}").expect("write");
        let ctx = AnswerContext {
            management_ip: "10.0.0.5".to_string(),
            management_netmask: "255.255.255.0".to_string(),
            management_gateway: "10.0.0.254".to_string(),
            hostname: derive_hostname("Host-", "10.0.0.5"),
            os_version: None,
            server_ip: "10.0.0.1".to_string(),
            report_port: 8089,
            repo_server_ip: "10.0.0.2".to_string(),
            node_uuid: "abc-123".to_string(),
            management_port: None,
            report_token: None,
        };
        assert!(TemplateRenderer::new().render(&path, &ctx).is_err());
    }
}
