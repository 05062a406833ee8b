//! Time-bounded line echo server
//!
//! Accepts one connection at a time, reads a single newline-terminated line
//! and writes it back unchanged before closing. A client that stays silent
//! is dropped after the read timeout so it cannot hold the server. The
//! server stops accepting once its lifetime has elapsed, measured from the
//! moment it starts listening, regardless of traffic.
//!
//! ```text
//! Idle ─► Listening ─► Connected ─► Echoing ─► Closed ─► Listening ...
//!             │
//!             └─ lifetime elapsed / cancelled ─► Expired
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelSignal;
use crate::error::{Error, Result};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Runtime parameters of an echo server
#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub bind_addr: String,
    /// `0` picks a free port
    pub port: u16,
    pub lifetime: Duration,
    /// How long a single connection may take to deliver its line
    pub read_timeout: Duration,
    /// Longest line echoed; longer input is cut at this length
    pub max_line_bytes: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8888,
            lifetime: Duration::from_secs(20),
            read_timeout: Duration::from_secs(5),
            max_line_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoState {
    Idle,
    Listening,
    Connected,
    Echoing,
    Closed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Expired,
    Cancelled,
}

/// What a server did during its lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EchoSummary {
    pub address: String,
    pub connections: u64,
    pub echoed: u64,
    pub failed: u64,
    pub stop_reason: StopReason,
    pub uptime_ms: u64,
}

pub struct EchoServer {
    listener: TcpListener,
    config: EchoConfig,
    state: EchoState,
}

impl EchoServer {
    /// Bind the listening socket; serving starts with [`EchoServer::serve`]
    pub async fn bind(config: EchoConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_addr, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::BindFailed { addr, source: e })?;

        Ok(Self {
            listener,
            config,
            state: EchoState::Idle,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Echo connections until the lifetime elapses or `cancel` fires
    ///
    /// The listener is closed on return, so later connection attempts are
    /// refused.
    pub async fn serve(self, mut cancel: CancelSignal) -> EchoSummary {
        let EchoServer {
            listener,
            config,
            mut state,
        } = self;

        let address = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{}:{}", config.bind_addr, config.port));

        let started = Instant::now();
        let deadline = started + config.lifetime;
        transition(&mut state, EchoState::Listening);
        info!(
            address = %address,
            lifetime_ms = config.lifetime.as_millis() as u64,
            "Echo server listening"
        );

        let mut connections = 0;
        let mut echoed = 0;
        let mut failed = 0;

        let stop_reason = loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break StopReason::Expired,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    failed += 1;
                    if !accept_backoff(&mut cancel).await {
                        break StopReason::Cancelled;
                    }
                    continue;
                }
            };

            connections += 1;
            transition(&mut state, EchoState::Connected);
            debug!(peer = %peer, "Accepted connection");

            let read_deadline = deadline.min(Instant::now() + config.read_timeout);
            let handled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout_at(read_deadline, echo_once(stream, config.max_line_bytes, &mut state)) => Some(result),
            };

            transition(&mut state, EchoState::Closed);
            match handled {
                None => break StopReason::Cancelled,
                Some(Err(_)) if read_deadline >= deadline => {
                    debug!(peer = %peer, "Lifetime elapsed mid-connection");
                    failed += 1;
                    break StopReason::Expired;
                }
                Some(Err(_)) => {
                    failed += 1;
                    debug!(
                        peer = %peer,
                        timeout_ms = config.read_timeout.as_millis() as u64,
                        "Dropped silent connection"
                    );
                }
                Some(Ok(Ok(0))) => debug!(peer = %peer, "Client closed without sending"),
                Some(Ok(Ok(bytes))) => {
                    echoed += 1;
                    info!(peer = %peer, bytes, "Echoed line");
                }
                Some(Ok(Err(e))) => {
                    failed += 1;
                    debug!(peer = %peer, error = %e, "Connection failed");
                }
            }
            transition(&mut state, EchoState::Listening);
        };

        drop(listener);
        transition(&mut state, EchoState::Expired);

        let summary = EchoSummary {
            address,
            connections,
            echoed,
            failed,
            stop_reason,
            uptime_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            connections = summary.connections,
            echoed = summary.echoed,
            reason = ?summary.stop_reason,
            "Echo server terminated"
        );
        summary
    }
}

/// Pause after a failed accept; false when cancelled meanwhile
async fn accept_backoff(cancel: &mut CancelSignal) -> bool {
    !cancel.sleep(ACCEPT_RETRY_DELAY).await
}

fn transition(state: &mut EchoState, next: EchoState) {
    trace!(from = ?*state, to = ?next, "Echo state");
    *state = next;
}

/// Read one line and write it back; returns the number of bytes echoed
async fn echo_once(stream: TcpStream, max_line_bytes: usize, state: &mut EchoState) -> io::Result<usize> {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    (&mut reader)
        .take(max_line_bytes as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if line.is_empty() {
        return Ok(0);
    }

    transition(state, EchoState::Echoing);
    let stream = reader.get_mut();
    stream.write_all(&line).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(line.len())
}
