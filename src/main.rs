//! pxe-auto - Main entry point
//!
//! Drives one node through the PXE auto-install lifecycle from the command
//! line. Node and port snapshots are read from JSON files; the node's
//! deployment context is persisted next to them between invocations.

use anyhow::{Context, bail};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use pxeauto::cli::{Cli, Commands, NodeArgs};
use pxeauto::collaborators::{
    Collaborators, CommandManagement, LockTable, LoggingEventSink, NodeLocker, acquire_with_retry,
};
use pxeauto::config::DeployConfig;
use pxeauto::deploy::{PxeAutoDeploy, VerifyRequest};
use pxeauto::endpoint::ProgressEndpoint;
use pxeauto::install_state::{DeploymentContext, DeploymentPhase};
use pxeauto::mac::parse_mac;
use pxeauto::node::{Node, Port};
use pxeauto::probe::{self, CancelToken};
use pxeauto::types::PortKind;
use pxeauto::verifier::spawn_verifier;

const REPORT_POLL: Duration = Duration::from_millis(200);

/// Initialize the logger with appropriate settings
fn init_logger() {
    use tracing_subscriber::EnvFilter;

    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .init();
}

/// Main application entry point
fn main() -> anyhow::Result<()> {
    init_logger();
    debug!("pxe-auto starting up");

    let cli = Cli::parse_args();
    let config = load_config(cli.config.as_deref())?;
    let locks = Arc::new(LockTable::new());
    let deployer = build_deployer(config, locks.clone())?;

    match cli.command {
        Commands::Validate { node } => {
            println!("✓ Configuration is valid");
            if let Some(path) = node {
                let node = load_node(&path)?;
                match deployer.validate(&node) {
                    Ok(()) => println!("✓ Node {} has every required parameter", node.uuid),
                    Err(e) => {
                        error!(node = %node.uuid, "Validation failed: {}", e);
                        eprintln!("✗ {}", e);
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::MacPath { mac, infiniband } => {
            let mac = parse_mac(&mac).context("Failed to parse MAC address")?;
            let kind = if infiniband {
                PortKind::Infiniband
            } else {
                PortKind::Ethernet
            };
            println!("{}", deployer.linker().mac_config_path(&mac, kind).display());
        }
        Commands::Prepare { node, ports } => {
            let ports = Port::load_all_from_file(&ports)
                .with_context(|| format!("Failed to load ports from {}", ports.display()))?;
            run_prepare(&deployer, locks.as_ref(), &node, &ports)?;
        }
        Commands::Deploy { node } => run_deploy(&deployer, locks.as_ref(), &node)?,
        Commands::CleanUp { node, ports } => {
            let ports = Port::load_all_from_file(&ports)
                .with_context(|| format!("Failed to load ports from {}", ports.display()))?;
            let snapshot = load_node(&node.node)?;
            deployer.clean_up(&snapshot, &ports)?;
            let mut ctx = load_state(&node.state_path())?;
            ctx.reset();
            save_state(&node.state_path(), &ctx)?;
            println!("✓ Cleaned up node {}", snapshot.uuid);
        }
        Commands::TearDown { node } => {
            let snapshot = load_node(&node.node)?;
            let lock = locks.acquire_exclusive(&snapshot.uuid)?;
            deployer.tear_down(&lock, &snapshot)?;
            println!("✓ Node {} powered off", snapshot.uuid);
        }
        Commands::Serve { node, listen } => {
            let listen = listen.unwrap_or_else(|| deployer.config().default_listen_addr());
            run_serve(Arc::new(deployer), locks.as_ref(), &node, &listen)?;
        }
        Commands::Wait {
            address,
            port,
            max_attempts,
        } => {
            let mut policy = deployer.config().probe.policy();
            if max_attempts.is_some() {
                policy.max_attempts = max_attempts;
            }
            let port = port.unwrap_or(deployer.config().probe.port);
            let cancel = install_ctrlc(CancelToken::new())?;
            let outcome = probe::wait_until_reachable(&address, port, &policy, &cancel)?;
            println!(
                "✓ {}:{} reachable after {} attempt(s) in {}s",
                address,
                port,
                outcome.attempts,
                outcome.elapsed.as_secs()
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DeployConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from: {:?}", path);
            DeployConfig::load_from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => DeployConfig::default(),
    };
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn build_deployer(config: DeployConfig, locks: Arc<LockTable>) -> anyhow::Result<PxeAutoDeploy> {
    let management = Arc::new(CommandManagement::new(config.management_commands.clone()));
    let collaborators = Collaborators {
        power: management.clone(),
        boot: management,
        events: Arc::new(LoggingEventSink),
        locks,
    };
    Ok(PxeAutoDeploy::new(config, collaborators)?)
}

fn load_node(path: &Path) -> anyhow::Result<Node> {
    Node::load_from_file(path).with_context(|| format!("Failed to load node from {}", path.display()))
}

fn load_state(path: &Path) -> anyhow::Result<DeploymentContext> {
    if !path.exists() {
        return Ok(DeploymentContext::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read deployment state {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse deployment state {}", path.display()))
}

fn save_state(path: &Path, ctx: &DeploymentContext) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(ctx)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write deployment state {}", path.display()))?;
    debug!(path = %path.display(), phase = %ctx.current_phase(), "Saved deployment state");
    Ok(())
}

fn install_ctrlc(cancel: CancelToken) -> anyhow::Result<CancelToken> {
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupted, cancelling");
        handler.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn run_prepare(
    deployer: &PxeAutoDeploy,
    locks: &dyn NodeLocker,
    args: &NodeArgs,
    ports: &[Port],
) -> anyhow::Result<()> {
    let node = load_node(&args.node)?;
    let state_path = args.state_path();
    let mut ctx = load_state(&state_path)?;
    let lock = locks.acquire_exclusive(&node.uuid)?;

    let result = deployer.prepare(&lock, &node, ports, &mut ctx);
    save_state(&state_path, &ctx)?;
    let prepared = result?;

    println!("✓ Boot config:  {}", prepared.boot_config.display());
    println!("✓ Answer file:  {}", prepared.answer_file.display());
    match prepared.mac_link {
        Some(link) => println!("✓ MAC link:     {}", link.display()),
        None => println!("! No port matches boot MAC {}; no link created", prepared.boot_mac),
    }
    Ok(())
}

fn run_deploy(deployer: &PxeAutoDeploy, locks: &dyn NodeLocker, args: &NodeArgs) -> anyhow::Result<()> {
    let node = load_node(&args.node)?;
    let state_path = args.state_path();
    let mut ctx = load_state(&state_path)?;
    let lock = locks.acquire_exclusive(&node.uuid)?;

    let result = deployer.deploy(&lock, &node, &mut ctx);
    save_state(&state_path, &ctx)?;
    let status = result?;
    println!("✓ Node {} rebooting into installer ({})", node.uuid, status);
    Ok(())
}

/// Run the progress endpoint and verifier until the node is done.
fn run_serve(
    deployer: Arc<PxeAutoDeploy>,
    locks: &dyn NodeLocker,
    args: &NodeArgs,
    listen: &str,
) -> anyhow::Result<()> {
    let node = load_node(&args.node)?;
    let state_path = args.state_path();
    let mut ctx = load_state(&state_path)?;
    let cancel = install_ctrlc(CancelToken::new())?;

    let endpoint = ProgressEndpoint::for_config(listen, deployer.config())
        .with_context(|| format!("Failed to start progress endpoint on {}", listen))?;
    let (report_tx, report_rx) = mpsc::channel();
    let endpoint_thread = endpoint.spawn(report_tx, cancel.clone());

    let (verify_tx, verify_rx) = mpsc::channel();
    let (response_tx, response_rx) = mpsc::channel();
    let verifier_thread = spawn_verifier(deployer.clone(), verify_rx, response_tx, cancel.clone());

    // A previous run may have stopped between reboot-to-disk and `done`
    if ctx.current_phase() == DeploymentPhase::Verifying {
        let address = node.instance_info.require("management_ip")?.to_string();
        verify_tx
            .send(VerifyRequest {
                node: node.clone(),
                address,
                port: deployer.config().probe.port,
            })
            .context("Verifier thread stopped unexpectedly")?;
    }

    info!(node = %node.uuid, phase = %ctx.current_phase(), "Waiting for installer progress");

    while !ctx.current_phase().is_terminal() && !cancel.is_cancelled() {
        match report_rx.recv_timeout(REPORT_POLL) {
            Ok(message) if message.node != node.uuid => {
                warn!(node = %message.node, "Ignoring report for a node this process does not serve");
            }
            Ok(message) => {
                let lock = acquire_with_retry(locks, &node.uuid, 10, REPORT_POLL)?;
                let result = deployer.on_progress(&lock, &node, &mut ctx, &message.report);
                drop(lock);
                save_state(&state_path, &ctx)?;
                match result {
                    Ok(action) => {
                        if let Some(request) = action.verify {
                            verify_tx
                                .send(request)
                                .context("Verifier thread stopped unexpectedly")?;
                        }
                    }
                    Err(e) => error!(node = %node.uuid, "Progress report not applied: {}", e),
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("Progress endpoint stopped unexpectedly"),
        }

        while let Ok(response) = response_rx.try_recv() {
            PxeAutoDeploy::apply_verification(&mut ctx, &response.result)?;
            save_state(&state_path, &ctx)?;
        }
    }

    cancel.cancel();
    drop(verify_tx);
    let _ = endpoint_thread.join();
    let _ = verifier_thread.join();

    if ctx.is_done() {
        println!("✓ Node {} deployed", node.uuid);
        Ok(())
    } else if ctx.is_failed() {
        bail!(
            "Deployment of node {} failed during {}",
            node.uuid,
            ctx.failed_at()
                .map(|phase| phase.to_string())
                .unwrap_or_else(|| "an unknown phase".to_string())
        )
    } else {
        bail!("Interrupted while node {} was {}", node.uuid, ctx.current_phase())
    }
}
