//! Reachability probing of a freshly deployed OS
//!
//! The driver has no other signal that the installed system came up, so it
//! keeps opening TCP connections to the node's management IP on the
//! remote-access port until one succeeds.
//!
//! # Design
//!
//! - **Pure Rust**: `TcpStream::connect_timeout`, no ping/shell
//! - **Bounded on request**: `ProbePolicy` carries optional attempt and
//!   deadline limits; with neither set the wait is unbounded
//! - **Cancellable**: a shared `CancelToken` is polled between attempts and
//!   while sleeping
//! - **Off the lock path**: callers run this without holding the node lock
//!   (see `verifier`)

use crate::error::{ProvisionError, Result};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Sleep granularity while waiting between attempts
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Retry policy for a reachability wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    /// Pause between failed attempts
    pub interval: Duration,
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    /// Give up after this many attempts (`None` = never)
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed (`None` = never)
    pub deadline: Option<Duration>,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl ProbePolicy {
    /// Retry every 3 seconds, forever
    pub const fn unbounded() -> Self {
        Self {
            interval: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            max_attempts: None,
            deadline: None,
        }
    }

    /// At most `max_attempts` attempts, `interval` apart
    pub const fn bounded(max_attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            connect_timeout: Duration::from_secs(5),
            max_attempts: Some(max_attempts),
            deadline: None,
        }
    }

    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.deadline.is_some_and(|deadline| elapsed >= deadline)
    }
}

/// Cooperative cancellation flag shared between a waiter and its owner
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a successful wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Anything that can block until `address:port` accepts connections.
pub trait ReachabilityProbe: Send + Sync {
    fn wait_until_reachable(
        &self,
        address: &str,
        port: u16,
        cancel: &CancelToken,
    ) -> Result<ProbeOutcome>;
}

/// TCP connect prober driven by a `ProbePolicy`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe {
    pub policy: ProbePolicy,
}

impl TcpProbe {
    pub fn new(policy: ProbePolicy) -> Self {
        Self { policy }
    }
}

impl ReachabilityProbe for TcpProbe {
    fn wait_until_reachable(
        &self,
        address: &str,
        port: u16,
        cancel: &CancelToken,
    ) -> Result<ProbeOutcome> {
        wait_until_reachable(address, port, &self.policy, cancel)
    }
}

/// Try one TCP connection to any address `address:port` resolves to.
pub fn try_connect(address: &str, port: u16, timeout: Duration) -> std::io::Result<SocketAddr> {
    let mut last_err = None;
    for addr in (address, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_stream) => return Ok(addr),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{} resolved to no addresses", address),
        )
    }))
}

/// Block until `address:port` accepts a TCP connection.
///
/// Each failure is logged with the attempt count and the time waited so
/// far, then the loop sleeps `policy.interval` and tries again.
///
/// # Errors
///
/// - `ProbeCancelled` once `cancel` is set
/// - `ProbeExhausted` when the policy's attempt or deadline limit is hit
pub fn wait_until_reachable(
    address: &str,
    port: u16,
    policy: &ProbePolicy,
    cancel: &CancelToken,
) -> Result<ProbeOutcome> {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ProvisionError::ProbeCancelled {
                address: format!("{}:{}", address, port),
            });
        }

        attempts += 1;
        match try_connect(address, port, policy.connect_timeout) {
            Ok(addr) => {
                info!(%addr, attempts, "Connected to {} on port {}", address, port);
                return Ok(ProbeOutcome {
                    attempts,
                    elapsed: started.elapsed(),
                });
            }
            Err(e) => {
                info!(
                    attempts,
                    waited_secs = started.elapsed().as_secs(),
                    "Connection to {} on port {} failed: {}",
                    address,
                    port,
                    e
                );
            }
        }

        if policy.exhausted(attempts, started.elapsed()) {
            return Err(ProvisionError::ProbeExhausted {
                address: format!("{}:{}", address, port),
                attempts,
            });
        }

        sleep_unless_cancelled(policy.interval, cancel);
    }
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) {
    let until = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= until || cancel.is_cancelled() {
            if cancel.is_cancelled() {
                debug!("Reachability wait interrupted by cancellation");
            }
            return;
        }
        std::thread::sleep(CANCEL_POLL.min(until - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// A loopback port with nothing listening on it
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    fn fast_policy(max_attempts: u32) -> ProbePolicy {
        ProbePolicy {
            interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(200),
            max_attempts: Some(max_attempts),
            deadline: None,
        }
    }

    #[test]
    fn test_succeeds_on_first_attempt_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let outcome =
            wait_until_reachable("127.0.0.1", port, &fast_policy(3), &CancelToken::new())
                .expect("reachable");
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let port = closed_port();
        let err = wait_until_reachable("127.0.0.1", port, &fast_policy(3), &CancelToken::new())
            .unwrap_err();
        match err {
            ProvisionError::ProbeExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = wait_until_reachable("127.0.0.1", closed_port(), &ProbePolicy::unbounded(), &cancel)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ProbeCancelled { .. }));
    }

    #[test]
    fn test_cancel_interrupts_unbounded_wait() {
        let port = closed_port();
        let cancel = CancelToken::new();
        let waiter = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                wait_until_reachable("127.0.0.1", port, &ProbePolicy::unbounded(), &cancel)
            })
        };

        std::thread::sleep(Duration::from_millis(200));
        cancel.cancel();
        let result = waiter.join().expect("waiter thread");
        assert!(matches!(result, Err(ProvisionError::ProbeCancelled { .. })));
    }

    #[test]
    fn test_becomes_reachable_after_retries() {
        let port = closed_port();
        let policy = ProbePolicy {
            interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
            max_attempts: Some(100),
            deadline: None,
        };

        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            let listener = TcpListener::bind(("127.0.0.1", port)).expect("rebind");
            std::thread::sleep(Duration::from_secs(2));
            drop(listener);
        });

        let outcome = wait_until_reachable("127.0.0.1", port, &policy, &CancelToken::new())
            .expect("eventually reachable");
        assert!(outcome.attempts > 1);
        opener.join().expect("opener");
    }

    #[test]
    fn test_policy_limits() {
        assert!(!ProbePolicy::unbounded().exhausted(10_000, Duration::from_secs(86_400)));
        let bounded = ProbePolicy::bounded(2, Duration::from_millis(1));
        assert!(!bounded.exhausted(1, Duration::ZERO));
        assert!(bounded.exhausted(2, Duration::ZERO));
        let deadline = ProbePolicy {
            deadline: Some(Duration::from_secs(1)),
            ..ProbePolicy::unbounded()
        };
        assert!(deadline.exhausted(1, Duration::from_secs(2)));
    }
}
