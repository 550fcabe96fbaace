//! Narrow interfaces to the driver's external collaborators
//!
//! The deploy driver never talks to IPMI, the node database or the
//! provision-state machine directly. It goes through these traits so the
//! host can plug in whatever it runs, and tests can record calls.
//!
//! Exclusive access to a node is represented by a [`NodeLock`] guard:
//! operations that mutate node state take `&NodeLock`, so calling them
//! without holding the lock does not compile.

use crate::config::ManagementCommands;
use crate::error::{ProvisionError, Result};
use crate::node::Node;
use crate::types::{BootDevice, PowerAction, ProvisionEvent};
use std::collections::HashSet;
use std::fmt;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Power control (IPMI or equivalent)
pub trait PowerControl: Send + Sync {
    fn power_action(&self, node: &Node, action: PowerAction) -> Result<()>;
}

/// Next-boot device control
pub trait BootDeviceControl: Send + Sync {
    fn set_boot_device(&self, node: &Node, device: BootDevice) -> Result<()>;
}

/// Provision-state event signalling
pub trait EventSink: Send + Sync {
    fn fire_event(&self, node: &Uuid, event: ProvisionEvent) -> Result<()>;
}

/// Exclusive per-node lock acquisition
pub trait NodeLocker: Send + Sync {
    /// Take the exclusive lock on `node`, failing if someone else holds it.
    fn acquire_exclusive(&self, node: &Uuid) -> Result<NodeLock>;
}

/// Everything the driver consumes from its host
#[derive(Clone)]
pub struct Collaborators {
    pub power: Arc<dyn PowerControl>,
    pub boot: Arc<dyn BootDeviceControl>,
    pub events: Arc<dyn EventSink>,
    pub locks: Arc<dyn NodeLocker>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// RAII guard for an exclusive node lock; released on drop.
pub struct NodeLock {
    node: Uuid,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl NodeLock {
    pub fn new(node: Uuid, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            node,
            release: Some(Box::new(release)),
        }
    }

    pub fn node(&self) -> &Uuid {
        &self.node
    }

    /// Error unless this guard is for `node`.
    pub fn ensure_held_for(&self, node: &Uuid) -> Result<()> {
        if &self.node == node {
            Ok(())
        } else {
            Err(ProvisionError::lock(format!(
                "lock held for node {} but operation targets node {}",
                self.node, node
            )))
        }
    }
}

impl fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLock").field("node", &self.node).finish()
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Acquire `node`'s lock, retrying while it is busy.
pub fn acquire_with_retry(
    locker: &dyn NodeLocker,
    node: &Uuid,
    attempts: u32,
    interval: Duration,
) -> Result<NodeLock> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match locker.acquire_exclusive(node) {
            Ok(lock) => return Ok(lock),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(node = %node, attempt, "Node lock busy: {}", e);
                attempt += 1;
                std::thread::sleep(interval);
            }
        }
    }
}

/// In-process lock table for hosts that run a single conductor
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, node: &Uuid) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(node))
            .unwrap_or(true)
    }
}

impl NodeLocker for LockTable {
    fn acquire_exclusive(&self, node: &Uuid) -> Result<NodeLock> {
        let mut held = self
            .held
            .lock()
            .map_err(|e| ProvisionError::lock(format!("lock table poisoned: {}", e)))?;
        if !held.insert(*node) {
            return Err(ProvisionError::lock(format!("node {} is locked", node)));
        }

        let table = Arc::clone(&self.held);
        let id = *node;
        Ok(NodeLock::new(id, move || {
            if let Ok(mut held) = table.lock() {
                held.remove(&id);
            }
        }))
    }
}

/// Power and boot-device control through operator-configured commands
#[derive(Debug, Clone, Default)]
pub struct CommandManagement {
    commands: ManagementCommands,
}

impl CommandManagement {
    pub fn new(commands: ManagementCommands) -> Self {
        Self { commands }
    }

    fn run(&self, argv: &[String], node: &Node, what: &str) -> std::result::Result<(), String> {
        let Some((program, args)) = argv.split_first() else {
            warn!(node = %node.uuid, "No command configured for {}, skipping", what);
            return Ok(());
        };

        let uuid = node.uuid.to_string();
        let args: Vec<String> = args.iter().map(|a| a.replace("{uuid}", &uuid)).collect();
        info!(node = %node.uuid, program = %program, args = ?args, "Running {}", what);

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("failed to spawn {}: {}", program, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "{} exited with {}: {}",
                program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

impl PowerControl for CommandManagement {
    fn power_action(&self, node: &Node, action: PowerAction) -> Result<()> {
        let argv = match action {
            PowerAction::Reboot => &self.commands.reboot,
            PowerAction::PowerOff => &self.commands.power_off,
        };
        self.run(argv, node, &action.to_string())
            .map_err(ProvisionError::Power)
    }
}

impl BootDeviceControl for CommandManagement {
    fn set_boot_device(&self, node: &Node, device: BootDevice) -> Result<()> {
        let argv = match device {
            BootDevice::Pxe => &self.commands.boot_pxe,
            BootDevice::Disk => &self.commands.boot_disk,
        };
        self.run(argv, node, &format!("boot device {}", device))
            .map_err(ProvisionError::BootDevice)
    }
}

/// Event sink that only logs; the host persists state itself
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn fire_event(&self, node: &Uuid, event: ProvisionEvent) -> Result<()> {
        info!(node = %node, %event, "Provision event");
        Ok(())
    }
}
