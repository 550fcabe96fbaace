//! PXE auto-install deploy driver
//!
//! Drives one node from "nothing prepared" to "installed OS reachable":
//!
//! 1. `validate` checks the instance parameters
//! 2. `prepare` renders the installer-answer file and boot config, links
//!    the boot MAC to the config and sets the next boot to PXE
//! 3. `deploy` reboots the node into the installer and returns at once
//! 4. `on_progress` consumes installer reports: crossing 60% fires
//!    `resume`; crossing 100% switches the boot device to disk, reboots,
//!    and hands back a [`VerifyRequest`]
//! 5. the verify request is probed without the node lock (see
//!    `verifier`); `finish_verification` then fires `done` under a freshly
//!    acquired lock
//!
//! `clean_up` removes every artifact and is safe to call at any point.

use crate::artifact::ArtifactStore;
use crate::collaborators::{Collaborators, NodeLock};
use crate::config::DeployConfig;
use crate::error::{ProvisionError, Result};
use crate::install_state::{DeploymentContext, DeploymentPhase};
use crate::mac::{MacAddress, MacLinker};
use crate::node::{Node, Port, find_boot_port};
use crate::probe::{CancelToken, ProbeOutcome, ReachabilityProbe, TcpProbe};
use crate::progress::ProgressReport;
use crate::template::{AnswerContext, BootConfigContext, TemplateRenderer, derive_hostname};
use crate::types::{BootDevice, DeployStatus, PortKind, PowerAction, ProvisionEvent};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Paths and derived facts produced by a successful `prepare`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedArtifacts {
    pub boot_mac: MacAddress,
    pub boot_config: PathBuf,
    pub answer_file: PathBuf,
    /// `None` when no port carries the boot MAC
    pub mac_link: Option<PathBuf>,
    /// Interface name chosen as management port, if inspection knew it
    pub management_port: Option<String>,
}

/// Work order for the out-of-band reachability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    pub node: Node,
    pub address: String,
    pub port: u16,
}

/// What a progress report caused
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressAction {
    /// `resume` was fired
    pub resumed: bool,
    /// Completion started; probe this, then call `finish_verification`
    pub verify: Option<VerifyRequest>,
}

/// The deploy driver for one conductor
#[derive(Clone)]
pub struct PxeAutoDeploy {
    config: DeployConfig,
    store: ArtifactStore,
    linker: MacLinker,
    renderer: TemplateRenderer,
    collaborators: Collaborators,
    probe: Arc<dyn ReachabilityProbe>,
}

impl std::fmt::Debug for PxeAutoDeploy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PxeAutoDeploy")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("linker", &self.linker)
            .finish_non_exhaustive()
    }
}

impl PxeAutoDeploy {
    /// Build a driver that probes with the TCP prober from `config.probe`.
    pub fn new(config: DeployConfig, collaborators: Collaborators) -> Result<Self> {
        let probe = Arc::new(TcpProbe::new(config.probe.policy()));
        Self::with_probe(config, collaborators, probe)
    }

    /// Build a driver with a caller-supplied prober.
    pub fn with_probe(
        config: DeployConfig,
        collaborators: Collaborators,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let store = ArtifactStore::new(&config.tftp_root, &config.answer_root);
        let linker = MacLinker::new(&config.tftp_root, config.hw_type_prefix());
        Ok(Self {
            config,
            store,
            linker,
            renderer: TemplateRenderer::new(),
            collaborators,
            probe,
        })
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn linker(&self) -> &MacLinker {
        &self.linker
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Instance parameters this driver requires, with descriptions.
    pub fn properties() -> BTreeMap<&'static str, &'static str> {
        BTreeMap::from([
            ("user_kernel", "Kernel image path, relative to the TFTP root. Required."),
            ("user_ramdisk", "Ramdisk image path, relative to the TFTP root. Required."),
            ("management_ip", "Static IP the installed OS is given. Required."),
            ("management_netmask", "Netmask for management_ip. Required."),
            ("management_gateway", "Default gateway for management_ip. Required."),
            ("os_ver", "OS release passed to the installer template. Optional."),
        ])
    }

    /// Fail with `MissingParameterValue` naming the first absent parameter.
    pub fn validate(&self, node: &Node) -> Result<()> {
        match node.instance_info.first_missing() {
            Some(missing) => Err(ProvisionError::missing(missing)),
            None => Ok(()),
        }
    }

    /// Render and write all artifacts, link the boot MAC, set PXE boot.
    ///
    /// On failure the context is marked failed and artifacts may be
    /// partially written; call `clean_up` before trying again.
    pub fn prepare(
        &self,
        lock: &NodeLock,
        node: &Node,
        ports: &[Port],
        ctx: &mut DeploymentContext,
    ) -> Result<PreparedArtifacts> {
        lock.ensure_held_for(&node.uuid)?;
        self.validate(node)?;
        if ctx.current_phase() != DeploymentPhase::Preparing {
            ctx.transition_to(DeploymentPhase::Preparing)?;
        }

        let prepared = match self.write_artifacts(node, ports) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(node = %node.uuid, "Prepare failed: {}", e);
                let _ = ctx.fail();
                return Err(e);
            }
        };

        if let Err(e) = self.set_boot_device(node, BootDevice::Pxe) {
            let _ = ctx.fail();
            return Err(e);
        }

        info!(
            node = %node.uuid,
            boot_mac = %prepared.boot_mac,
            boot_config = %prepared.boot_config.display(),
            answer_file = %prepared.answer_file.display(),
            "Prepared node for PXE auto-install"
        );
        Ok(prepared)
    }

    fn write_artifacts(&self, node: &Node, ports: &[Port]) -> Result<PreparedArtifacts> {
        let boot_mac = node.boot_interface_mac()?;
        let management_port = node.interface_name_for(&boot_mac).map(str::to_string);
        if management_port.is_none() {
            warn!(node = %node.uuid, boot_mac = %boot_mac, "No discovered interface matches the boot MAC");
        }

        // Render both before touching the filesystem
        let answer = self.renderer.render(
            &self.config.answer_template,
            &self.answer_context(node, management_port.clone())?,
        )?;
        let boot_config = self
            .renderer
            .render(&self.config.boot_config_template, &self.boot_context(node)?)?;

        let answer_file = self.store.answer_path(&node.uuid);
        self.store.write_artifact(&answer_file, &answer)?;

        self.store.ensure_dir(&self.store.boot_config_dir(&node.uuid))?;
        self.store.ensure_dir(&self.linker.pxe_cfg_dir())?;
        let boot_config_path = self.store.boot_config_path(&node.uuid);
        self.store.write_artifact(&boot_config_path, &boot_config)?;

        let mac_link = match find_boot_port(ports, &boot_mac) {
            Some(port) => Some(self.linker.link(&boot_mac, port.kind(), &boot_config_path)?),
            None => {
                warn!(node = %node.uuid, boot_mac = %boot_mac, "No port carries the boot MAC; no link created");
                None
            }
        };

        Ok(PreparedArtifacts {
            boot_mac,
            boot_config: boot_config_path,
            answer_file,
            mac_link,
            management_port,
        })
    }

    fn boot_context(&self, node: &Node) -> Result<BootConfigContext> {
        let info = &node.instance_info;
        Ok(BootConfigContext {
            kernel: self
                .store
                .tftp_root()
                .join(info.require("user_kernel")?)
                .display()
                .to_string(),
            ramdisk: self
                .store
                .tftp_root()
                .join(info.require("user_ramdisk")?)
                .display()
                .to_string(),
            server_ip: self.config.my_ip.clone(),
            node_uuid: node.uuid.to_string(),
        })
    }

    fn answer_context(&self, node: &Node, management_port: Option<String>) -> Result<AnswerContext> {
        let info = &node.instance_info;
        let management_ip = info.require("management_ip")?;
        Ok(AnswerContext {
            management_ip: management_ip.to_string(),
            management_netmask: info.require("management_netmask")?.to_string(),
            management_gateway: info.require("management_gateway")?.to_string(),
            hostname: derive_hostname(&self.config.hostname_prefix, management_ip),
            os_version: info.get("os_ver").map(str::to_string),
            server_ip: self.config.my_ip.clone(),
            report_port: self.config.report_port,
            repo_server_ip: self.config.repo_server.clone(),
            node_uuid: node.uuid.to_string(),
            management_port,
            report_token: self.config.report_token.clone(),
        })
    }

    /// Reboot into the installer; returns without waiting.
    pub fn deploy(
        &self,
        lock: &NodeLock,
        node: &Node,
        ctx: &mut DeploymentContext,
    ) -> Result<DeployStatus> {
        lock.ensure_held_for(&node.uuid)?;
        ctx.transition_to(DeploymentPhase::BootTriggered)?;

        if let Err(e) = self
            .collaborators
            .power
            .power_action(node, PowerAction::Reboot)
        {
            let _ = ctx.fail();
            return Err(e);
        }

        info!(node = %node.uuid, "Rebooting node into installer");
        Ok(DeployStatus::DeployWait)
    }

    /// Apply one installer progress report.
    ///
    /// The caller must hold (or have re-acquired) the node lock. Completion
    /// does not probe here; probe the returned `VerifyRequest` after
    /// releasing the lock.
    pub fn on_progress(
        &self,
        lock: &NodeLock,
        node: &Node,
        ctx: &mut DeploymentContext,
        report: &ProgressReport,
    ) -> Result<ProgressAction> {
        lock.ensure_held_for(&node.uuid)?;
        let percent = report.percent();
        info!(
            node = %node.uuid,
            title = %report.title(),
            progress = percent,
            "Install progress report"
        );

        match ctx.current_phase() {
            phase if phase.is_terminal() => {
                debug!(node = %node.uuid, %phase, "Ignoring progress report for finished deployment");
                return Ok(ProgressAction::default());
            }
            DeploymentPhase::NotStarted | DeploymentPhase::Preparing => {
                return Err(ProvisionError::Transition(format!(
                    "progress reported for node {} before deploy",
                    node.uuid
                )));
            }
            DeploymentPhase::BootTriggered => {
                ctx.transition_to(DeploymentPhase::WaitingForProgress)?;
            }
            _ => {}
        }

        ctx.set_last_title(report.title());
        let crossings = ctx.observe_progress(percent);
        let mut action = ProgressAction::default();

        if crossings.resume {
            if let Err(e) = self
                .collaborators
                .events
                .fire_event(&node.uuid, ProvisionEvent::Resume)
            {
                let _ = ctx.fail();
                return Err(e);
            }
            ctx.transition_to(DeploymentPhase::Resuming)?;
            info!(node = %node.uuid, "resume...");
            action.resumed = true;
        }

        if crossings.complete {
            ctx.transition_to(DeploymentPhase::Verifying)?;
            match self.start_completion(node) {
                Ok(request) => action.verify = Some(request),
                Err(e) => {
                    let _ = ctx.fail();
                    return Err(e);
                }
            }
        }

        Ok(action)
    }

    /// Lock-holding half of completion: boot from disk and reboot.
    fn start_completion(&self, node: &Node) -> Result<VerifyRequest> {
        let address = node.instance_info.require("management_ip")?.to_string();
        self.set_boot_device(node, BootDevice::Disk)?;
        self.collaborators
            .power
            .power_action(node, PowerAction::Reboot)?;

        info!(node = %node.uuid, %address, "Install finished; rebooting into deployed OS");
        Ok(VerifyRequest {
            node: node.clone(),
            address,
            port: self.config.probe.port,
        })
    }

    /// Lock-free half of completion: wait for the deployed OS.
    pub fn probe_reachability(
        &self,
        request: &VerifyRequest,
        cancel: &CancelToken,
    ) -> Result<ProbeOutcome> {
        self.probe
            .wait_until_reachable(&request.address, request.port, cancel)
    }

    /// Fire `done` for a node whose OS answered the probe.
    pub fn finish_verification(&self, lock: &NodeLock, node: &Node) -> Result<()> {
        lock.ensure_held_for(&node.uuid)?;
        self.collaborators
            .events
            .fire_event(&node.uuid, ProvisionEvent::Done)?;
        info!(node = %node.uuid, "Deployment to node {} done", node.uuid);
        Ok(())
    }

    /// Record a verification result in the caller's context.
    pub fn apply_verification(
        ctx: &mut DeploymentContext,
        result: &std::result::Result<ProbeOutcome, String>,
    ) -> Result<()> {
        match result {
            Ok(_) => {
                ctx.transition_to(DeploymentPhase::Done)?;
            }
            Err(_) => {
                ctx.fail()?;
            }
        }
        Ok(())
    }

    /// Remove the MAC link, boot config, per-node directory and answer file.
    ///
    /// Missing pieces are skipped, so this is safe on a node that never
    /// finished (or never started) `prepare`.
    pub fn clean_up(&self, node: &Node, ports: &[Port]) -> Result<()> {
        match node.boot_interface_mac() {
            Ok(mac) => {
                let kinds = match find_boot_port(ports, &mac) {
                    Some(port) => vec![port.kind()],
                    None => vec![PortKind::Ethernet, PortKind::Infiniband],
                };
                for kind in kinds {
                    self.linker.unlink(&mac, kind)?;
                }
            }
            Err(e) => {
                debug!(node = %node.uuid, "No boot MAC to unlink: {}", e);
            }
        }

        self.store
            .delete_artifact(&self.store.boot_config_path(&node.uuid))?;
        self.store
            .delete_tree(&self.store.boot_config_dir(&node.uuid))?;
        self.store
            .delete_artifact(&self.store.answer_path(&node.uuid))?;

        info!(node = %node.uuid, "Cleaned up PXE auto-install artifacts");
        Ok(())
    }

    /// Power the node off.
    pub fn tear_down(&self, lock: &NodeLock, node: &Node) -> Result<()> {
        lock.ensure_held_for(&node.uuid)?;
        self.collaborators
            .power
            .power_action(node, PowerAction::PowerOff)?;
        info!(node = %node.uuid, "Powered node off");
        Ok(())
    }

    /// Adopt a node already deployed by another conductor. Nothing to do.
    pub fn take_over(&self, node: &Node) -> Result<()> {
        debug!(node = %node.uuid, "take_over: no action needed");
        Ok(())
    }

    fn set_boot_device(&self, node: &Node, device: BootDevice) -> Result<()> {
        match self.collaborators.boot.set_boot_device(node, device) {
            Ok(()) => Ok(()),
            Err(e) if self.config.boot_device_policy.is_strict() => Err(e),
            Err(e) => {
                warn!(node = %node.uuid, %device, "Failed to set boot device, continuing: {}", e);
                Ok(())
            }
        }
    }
}
