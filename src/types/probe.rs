//! Probe round request and result types

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PeerId, TaskId};

/// Default per-connection timeout for the echo round-trip
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default number of registry polls before discovery gives up
pub const DEFAULT_RETRY_BUDGET: u32 = 20;

/// Default pause between registry polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Default boot time granted to remote workers before the first poll
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(5);

/// Label under which algorithm images expose the echo port
pub const DEFAULT_ECHO_LABEL: &str = "port8";

// ─────────────────────────────────────────────────────────────────
// Probe Request
// ─────────────────────────────────────────────────────────────────

/// Parameters of a single probe round
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    /// Peers expected to start an echo service
    pub target_peers: BTreeSet<PeerId>,

    /// Connect and read timeout, applied to each phase of the echo exchange
    pub timeout: Duration,

    /// Maximum number of registry polls
    pub retry_budget: u32,

    /// Pause between registry polls
    pub poll_interval: Duration,

    /// Delay between dispatch and the first registry poll
    pub warmup: Duration,

    /// Port label the echo service is published under
    pub label: String,
}

impl ProbeRequest {
    /// Create a request for the given peers with default timings
    pub fn new(target_peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            target_peers: target_peers.into_iter().collect(),
            timeout: DEFAULT_PROBE_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            poll_interval: DEFAULT_POLL_INTERVAL,
            warmup: DEFAULT_WARMUP,
            label: DEFAULT_ECHO_LABEL.to_string(),
        }
    }

    /// Number of peers whose address must be discovered
    pub fn expected_peers(&self) -> usize {
        self.target_peers.len()
    }
}

// ─────────────────────────────────────────────────────────────────
// Probe Result
// ─────────────────────────────────────────────────────────────────

/// Verdict for one expected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub peer_id: PeerId,
    pub reachable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Endpoint that was probed, if an address was discovered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip_ms: Option<u64>,
}

impl ProbeResult {
    /// A successful echo round-trip
    pub fn reachable(peer_id: PeerId, address: impl Into<String>, round_trip: Duration) -> Self {
        Self {
            peer_id,
            reachable: true,
            error: None,
            address: Some(address.into()),
            round_trip_ms: Some(round_trip.as_millis() as u64),
        }
    }

    /// A failed peer; `address` is `None` when the peer never published one
    pub fn unreachable(peer_id: PeerId, address: Option<String>, error: impl Into<String>) -> Self {
        Self {
            peer_id,
            reachable: false,
            error: Some(error.into()),
            address,
            round_trip_ms: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Probe Outcome
// ─────────────────────────────────────────────────────────────────

/// Aggregated result of a probe round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Logical AND over every peer's verdict
    pub all_reachable: bool,

    /// One entry per expected peer, ordered by peer id
    pub results: Vec<ProbeResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    /// Registry polls spent on discovery
    pub polls: u32,

    /// Whether every expected address was discovered within the budget
    pub discovery_complete: bool,

    /// When the round finished; unset for outcomes built outside a round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProbeOutcome {
    /// Aggregate results in any completion order into a deterministic outcome
    pub fn from_results(mut results: Vec<ProbeResult>) -> Self {
        results.sort_by_key(|r| r.peer_id);
        let all_reachable = results.iter().all(|r| r.reachable);

        Self {
            all_reachable,
            results,
            task_id: None,
            polls: 0,
            discovery_complete: true,
            finished_at: None,
        }
    }

    /// Number of reachable peers
    pub fn reachable_count(&self) -> usize {
        self.results.iter().filter(|r| r.reachable).count()
    }

    /// Results of peers that failed
    pub fn failures(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.iter().filter(|r| !r.reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(peer: u64) -> ProbeResult {
        ProbeResult::reachable(PeerId(peer), format!("10.0.0.{}:8888", peer), Duration::from_millis(3))
    }

    fn failed(peer: u64) -> ProbeResult {
        ProbeResult::unreachable(PeerId(peer), None, "no address published")
    }

    #[test]
    fn test_request_defaults() {
        let request = ProbeRequest::new([PeerId(3), PeerId(2), PeerId(3)]);
        assert_eq!(request.expected_peers(), 2);
        assert_eq!(request.retry_budget, 20);
        assert_eq!(request.poll_interval, Duration::from_secs(4));
        assert_eq!(request.warmup, Duration::from_secs(5));
        assert_eq!(request.timeout, Duration::from_secs(20));
        assert_eq!(request.label, "port8");
    }

    #[test]
    fn test_outcome_is_order_independent() {
        let forward = ProbeOutcome::from_results(vec![ok(1), failed(2), ok(3)]);
        let shuffled = ProbeOutcome::from_results(vec![ok(3), ok(1), failed(2)]);
        let reversed = ProbeOutcome::from_results(vec![ok(3), failed(2), ok(1)]);

        assert_eq!(forward, shuffled);
        assert_eq!(forward, reversed);
        let order: Vec<u64> = forward.results.iter().map(|r| r.peer_id.0).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_all_reachable_is_conjunction() {
        assert!(ProbeOutcome::from_results(vec![ok(1), ok(2)]).all_reachable);
        assert!(!ProbeOutcome::from_results(vec![ok(1), failed(2)]).all_reachable);
        assert!(ProbeOutcome::from_results(vec![]).all_reachable);
    }

    #[test]
    fn test_counts() {
        let outcome = ProbeOutcome::from_results(vec![ok(1), failed(2), ok(3)]);
        assert_eq!(outcome.reachable_count(), 2);
        assert_eq!(outcome.failures().count(), 1);
    }

    #[test]
    fn test_unreachable_serialization_omits_empty_fields() {
        let json = serde_json::to_value(failed(4)).unwrap();
        assert_eq!(json["peer_id"], 4);
        assert_eq!(json["reachable"], false);
        assert!(json.get("address").is_none());
        assert!(json.get("round_trip_ms").is_none());
    }
}
