//! In-process probe round
//!
//! Starts local echo servers, routes them through a [`MemoryPlatform`] and
//! runs the real coordinator against them. Silent peers are never routed,
//! so they exercise the retry budget exactly as an offline node would.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cancel::{CancelHandle, CancelSignal};
use crate::config::ProbeSettings;
use crate::echo::{EchoConfig, EchoServer, EchoSummary};
use crate::error::{Error, Result};
use crate::platform::{MemoryPlatform, PeerRoute};
use crate::probe::ProbeCoordinator;
use crate::types::{PeerId, ProbeOutcome};

/// Timings shrunk so a full round takes seconds rather than minutes
const SELFTEST_WARMUP: Duration = Duration::from_millis(50);
const SELFTEST_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SELFTEST_ECHO_LIFETIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct SelftestOptions {
    /// Simulated peers
    pub peers: u64,
    /// Peers among them that never publish an address
    pub silent: u64,
}

/// Run one probe round against `options.peers` local peers
pub async fn run_selftest(options: SelftestOptions, probe: &ProbeSettings, cancel: CancelSignal) -> Result<ProbeOutcome> {
    if options.silent > options.peers {
        return Err(Error::config_field_invalid(
            "silent",
            format!("{} silent peers requested but only {} peers", options.silent, options.peers),
        ));
    }

    let platform = Arc::new(MemoryPlatform::new());
    let (stop, servers) = start_servers(&platform, options, probe).await?;

    let mut request = probe.request((1..=options.peers).map(PeerId));
    request.warmup = SELFTEST_WARMUP;
    request.poll_interval = SELFTEST_POLL_INTERVAL;

    let coordinator = ProbeCoordinator::new(platform.clone(), platform.clone(), probe.coordinator_settings());
    let outcome = coordinator.run(&request, cancel).await;

    let _ = stop.send(true);
    for server in servers {
        if let Ok(summary) = server.await {
            debug!(address = %summary.address, echoed = summary.echoed, "Local peer stopped");
        }
    }

    outcome
}

/// Start an echo server for every non-silent peer
///
/// Appearances are staggered over the polls of the retry budget, wrapping
/// around when there are more peers than polls.
async fn start_servers(
    platform: &MemoryPlatform,
    options: SelftestOptions,
    probe: &ProbeSettings,
) -> Result<(CancelHandle, Vec<JoinHandle<EchoSummary>>)> {
    let (stop, signal) = CancelSignal::new();
    let live = options.peers - options.silent;
    let budget = u64::from(probe.retry_budget.max(1));
    let mut servers = Vec::new();

    for peer in 1..=live {
        let server = EchoServer::bind(EchoConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            lifetime: SELFTEST_ECHO_LIFETIME,
            ..EchoConfig::default()
        })
        .await?;
        let addr = server.local_addr()?;

        platform.route(
            PeerId(peer),
            PeerRoute {
                ip: addr.ip().to_string(),
                port: addr.port(),
                label: probe.label.clone(),
                visible_from_poll: (1 + (peer - 1) % budget) as u32,
            },
        );
        servers.push(tokio::spawn(server.serve(signal.clone())));
    }

    info!(live, silent = options.silent, "Local peers started");
    Ok((stop, servers))
}
