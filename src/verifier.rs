//! verifier.rs - Runs post-install reachability checks on a background thread.
//!
//! The lock-holding half of completion (`on_progress`) only reboots the node
//! and hands back a `VerifyRequest`. This thread receives those requests,
//! waits for the deployed OS without holding any node lock, then re-acquires
//! the lock just long enough to fire `done`. The outcome is sent back so the
//! host can update its `DeploymentContext`.

use crate::collaborators::acquire_with_retry;
use crate::deploy::{PxeAutoDeploy, VerifyRequest};
use crate::error::Result;
use crate::probe::{CancelToken, ProbeOutcome};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts at re-acquiring the node lock before giving up
pub const LOCK_RETRY_ATTEMPTS: u32 = 20;

/// Pause between lock attempts
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// The outcome of one verification
#[derive(Debug)]
pub struct VerifyResponse {
    pub node: Uuid,
    pub result: std::result::Result<ProbeOutcome, String>, // Ok(outcome), Err(error_message)
}

/// Probe, re-lock and fire `done` for one request.
pub fn verify_one(
    deployer: &PxeAutoDeploy,
    request: &VerifyRequest,
    cancel: &CancelToken,
) -> Result<ProbeOutcome> {
    let outcome = deployer.probe_reachability(request, cancel)?;

    let locks = Arc::clone(&deployer.collaborators().locks);
    let lock = acquire_with_retry(
        locks.as_ref(),
        &request.node.uuid,
        LOCK_RETRY_ATTEMPTS,
        LOCK_RETRY_INTERVAL,
    )?;
    deployer.finish_verification(&lock, &request.node)?;
    Ok(outcome)
}

/// Spawn the verifier thread.
///
/// Requests are handled one at a time in arrival order. The thread exits
/// when the request channel closes or the response receiver is dropped.
pub fn spawn_verifier(
    deployer: Arc<PxeAutoDeploy>,
    request_rx: Receiver<VerifyRequest>,
    response_tx: Sender<VerifyResponse>,
    cancel: CancelToken,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        debug!("Verifier thread started");
        while let Ok(request) = request_rx.recv() {
            let node = request.node.uuid;
            info!(node = %node, address = %request.address, port = request.port, "Verifying deployed OS");

            let result = verify_one(&deployer, &request, &cancel).map_err(|e| {
                warn!(node = %node, "Verification failed: {}", e);
                e.to_string()
            });

            if response_tx.send(VerifyResponse { node, result }).is_err() {
                error!("Failed to send verify response. Receiver probably dropped.");
                break;
            }
        }
        debug!("Verifier thread shut down");
    })
}
