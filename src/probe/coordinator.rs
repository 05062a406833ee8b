//! Probe round coordination
//!
//! Dispatches the echo task, waits out the warm-up, discovers peer
//! addresses and fans out echo probes with bounded concurrency. Every
//! expected peer ends up with exactly one [`ProbeResult`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::platform::{AddressRegistry, TaskDispatcher};
use crate::types::{PeerAddress, PeerId, ProbeOutcome, ProbeRequest, ProbeResult, TaskHandle, TaskInput};

use super::discovery::{discover_addresses, Discovery, DiscoveryConfig, PollSchedule};
use super::echo_client::{probe_echo, PROBE_MESSAGE};

/// Method the remote workers run to start their echo server
pub const ECHO_METHOD: &str = "RPC_echo";

/// Error recorded for peers skipped because the round was cancelled
pub const CANCELLED_ERROR: &str = "probe cancelled";

/// Knobs of the coordinator that are not part of a single request
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Maximum simultaneous echo probes
    pub concurrency: usize,

    /// Interval evolution between registry polls
    pub schedule: PollSchedule,

    /// Upper bound on the poll interval for exponential schedules
    pub max_poll_interval: Duration,

    /// Payload sent to each peer
    pub message: Vec<u8>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            schedule: PollSchedule::Fixed,
            max_poll_interval: Duration::from_secs(30),
            message: PROBE_MESSAGE.to_vec(),
        }
    }
}

/// Runs probe rounds against a platform
pub struct ProbeCoordinator {
    dispatcher: Arc<dyn TaskDispatcher>,
    registry: Arc<dyn AddressRegistry>,
    settings: CoordinatorSettings,
}

impl ProbeCoordinator {
    pub fn new(
        dispatcher: Arc<dyn TaskDispatcher>,
        registry: Arc<dyn AddressRegistry>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            settings,
        }
    }

    /// Probe every peer in `request.target_peers`
    ///
    /// Fails only if the echo task cannot be dispatched. Unreachable peers,
    /// registry hiccups and cancellation all yield an `Ok` outcome in
    /// which the affected peers are marked unreachable.
    pub async fn run(&self, request: &ProbeRequest, cancel: CancelSignal) -> Result<ProbeOutcome> {
        let probe_id = Uuid::new_v4();
        let span = info_span!("probe", probe_id = %probe_id);
        self.run_round(request, cancel).instrument(span).await
    }

    async fn run_round(&self, request: &ProbeRequest, mut cancel: CancelSignal) -> Result<ProbeOutcome> {
        if request.target_peers.is_empty() {
            info!("No peers to probe");
            return Ok(ProbeOutcome::from_results(Vec::new()));
        }

        let handle = self
            .dispatcher
            .submit_task(&TaskInput::new(ECHO_METHOD), &request.target_peers)
            .await?;
        info!(
            task_id = %handle.id,
            peers = request.target_peers.len(),
            "Echo task dispatched"
        );

        info!(warmup_ms = request.warmup.as_millis() as u64, "Waiting for peers to start");
        if cancel.sleep(request.warmup).await {
            info!("Probe cancelled during warm-up");
            let discovery = Discovery {
                cancelled: true,
                ..Discovery::default()
            };
            return Ok(self.finish(request, handle, &discovery, Vec::new()));
        }

        let config = DiscoveryConfig::for_request(request, self.settings.schedule, self.settings.max_poll_interval);
        let discovery = discover_addresses(
            self.registry.as_ref(),
            handle,
            &request.target_peers,
            &config,
            &mut cancel,
        )
        .await;

        let results = if discovery.cancelled {
            Vec::new()
        } else {
            self.probe_discovered(request, &discovery).await
        };

        Ok(self.finish(request, handle, &discovery, results))
    }

    /// Echo-probe every discovered address
    async fn probe_discovered(&self, request: &ProbeRequest, discovery: &Discovery) -> Vec<ProbeResult> {
        let message = self.settings.message.as_slice();
        let timeout = request.timeout;

        let probes = discovery.addresses.iter().map(|address| probe_peer(address, message, timeout));

        stream::iter(probes)
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await
    }

    /// Fill in a failure for every peer without a probe result and aggregate
    fn finish(
        &self,
        request: &ProbeRequest,
        handle: TaskHandle,
        discovery: &Discovery,
        mut results: Vec<ProbeResult>,
    ) -> ProbeOutcome {
        for &peer in &request.target_peers {
            if results.iter().any(|r| r.peer_id == peer) {
                continue;
            }
            let address = discovery.address_of(peer).map(PeerAddress::endpoint);
            let error = if discovery.cancelled {
                CANCELLED_ERROR.to_string()
            } else {
                format!("no address published after {} polls", discovery.polls)
            };
            results.push(ProbeResult::unreachable(peer, address, error));
        }

        let mut outcome = ProbeOutcome::from_results(results);
        outcome.task_id = Some(handle.id);
        outcome.polls = discovery.polls;
        outcome.discovery_complete = discovery.complete;
        outcome.finished_at = Some(Utc::now());

        if outcome.all_reachable {
            info!(peers = outcome.results.len(), "All peers reachable");
        } else {
            warn!(
                reachable = outcome.reachable_count(),
                expected = outcome.results.len(),
                unreachable = ?outcome.failures().map(|r| r.peer_id).collect::<Vec<PeerId>>(),
                "Not all peers reachable"
            );
        }

        outcome
    }
}

async fn probe_peer(address: &PeerAddress, message: &[u8], timeout: Duration) -> ProbeResult {
    let endpoint = address.endpoint();
    debug!(peer = %address.peer_id, endpoint = %endpoint, "Sending echo probe");

    match probe_echo(&endpoint, message, timeout).await {
        Ok(rtt) => {
            info!(
                peer = %address.peer_id,
                endpoint = %endpoint,
                rtt_ms = rtt.as_millis() as u64,
                "Peer reachable"
            );
            ProbeResult::reachable(address.peer_id, endpoint, rtt)
        }
        Err(e) => {
            warn!(peer = %address.peer_id, endpoint = %endpoint, error = %e, "Echo probe failed");
            ProbeResult::unreachable(address.peer_id, Some(endpoint), e.to_string())
        }
    }
}
