//! Progress report listener
//!
//! Installers report progress as one JSON object per line over TCP:
//!
//! ```text
//! {"node": "<uuid>", "token": "<shared secret>", "report": {"Title": "...", "InstallProgress": 0.4}}
//! ```
//!
//! Each line gets a one-line reply, `ok` or `error: <reason>`. Accepted
//! reports are forwarded over a channel to whoever owns the deployment
//! contexts; the endpoint never touches node state itself.
//!
//! Everything on the wire is untrusted. Lines are length-limited, the
//! number of open clients is capped, reports are validated by
//! [`ProgressReport`], and every envelope must carry the shared token,
//! compared in constant time.

use crate::config::DeployConfig;
use crate::error::{ProvisionError, Result};
use crate::probe::CancelToken;
use crate::progress::ProgressReport;
use constant_time_eq::constant_time_eq;
use serde::Deserialize;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest accepted line, in bytes
pub const MAX_LINE_LEN: usize = 4096;

/// Idle time after which a client connection is dropped
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on concurrently served clients
pub const MAX_CLIENTS: usize = 64;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// An authenticated, validated report for one node
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressMessage {
    pub node: Uuid,
    pub report: ProgressReport,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    node: Uuid,
    #[serde(default)]
    token: Option<String>,
    report: ProgressReport,
}

/// Parse one wire line and check its token.
pub fn parse_envelope(line: &str, expected_token: &str) -> Result<ProgressMessage> {
    let envelope: Envelope = serde_json::from_str(line.trim())
        .map_err(|e| ProvisionError::invalid_report(e.to_string()))?;

    let presented = envelope.token.as_deref().unwrap_or_default();
    if !constant_time_eq(presented.as_bytes(), expected_token.as_bytes()) {
        return Err(ProvisionError::Unauthorized);
    }

    Ok(ProgressMessage {
        node: envelope.node,
        report: envelope.report,
    })
}

/// TCP listener forwarding progress reports to a channel
#[derive(Debug)]
pub struct ProgressEndpoint {
    listener: TcpListener,
    token: Arc<str>,
    max_clients: usize,
}

/// Releases a client slot when the client's thread ends
struct ClientSlot(Arc<AtomicUsize>);

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ProgressEndpoint {
    /// Bind `addr`, accepting only envelopes that carry `token`.
    pub fn bind(addr: impl ToSocketAddrs, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(ProvisionError::config("progress endpoint needs a non-empty token"));
        }
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            token: Arc::from(token),
            max_clients: MAX_CLIENTS,
        })
    }

    /// Bind `addr` with the token from `config`; fails if none is configured.
    pub fn for_config(addr: impl ToSocketAddrs, config: &DeployConfig) -> Result<Self> {
        Self::bind(addr, config.require_report_token()?)
    }

    /// Cap the number of clients served at once; extra clients are turned away.
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients.max(1);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections on a background thread until `cancel` is set.
    ///
    /// Each client is served on its own thread, up to the client cap.
    pub fn spawn(self, reports: Sender<ProgressMessage>, cancel: CancelToken) -> JoinHandle<()> {
        let active = Arc::new(AtomicUsize::new(0));
        std::thread::spawn(move || {
            match self.listener.local_addr() {
                Ok(addr) => info!(%addr, "Progress endpoint listening"),
                Err(e) => warn!("Progress endpoint listening on unknown address: {}", e),
            }

            while !cancel.is_cancelled() {
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        if active.fetch_add(1, Ordering::AcqRel) >= self.max_clients {
                            active.fetch_sub(1, Ordering::AcqRel);
                            warn!(%peer, limit = self.max_clients, "Too many progress clients, refusing");
                            turn_away(stream);
                            continue;
                        }
                        debug!(%peer, "Progress client connected");
                        let slot = ClientSlot(active.clone());
                        let reports = reports.clone();
                        let token = self.token.clone();
                        std::thread::spawn(move || {
                            let _slot = slot;
                            if let Err(e) = serve_client(stream, peer, &token, &reports) {
                                debug!(%peer, "Progress client closed: {}", e);
                            }
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        error!("Accepting progress client failed: {}", e);
                        std::thread::sleep(ACCEPT_POLL);
                    }
                }
            }
            debug!("Progress endpoint shut down");
        })
    }
}

fn turn_away(mut stream: TcpStream) {
    let _ = stream
        .set_nonblocking(false)
        .and_then(|()| writeln!(stream, "error: too many clients"));
}

fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    token: &str,
    reports: &Sender<ProgressMessage>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_line(&mut line)?;
        if read == 0 {
            return Ok(());
        }
        if read > MAX_LINE_LEN {
            warn!(%peer, "Progress line too long, dropping client");
            writeln!(writer, "error: line exceeds {} bytes", MAX_LINE_LEN)?;
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        match parse_envelope(&line, token) {
            Ok(message) => {
                debug!(%peer, node = %message.node, "Accepted progress report");
                if reports.send(message).is_err() {
                    writeln!(writer, "error: endpoint shutting down")?;
                    return Ok(());
                }
                writeln!(writer, "ok")?;
            }
            Err(e) => {
                warn!(%peer, "Rejected progress report: {}", e);
                writeln!(writer, "error: {}", e)?;
            }
        }
    }
}
