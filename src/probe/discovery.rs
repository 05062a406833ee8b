//! Address discovery
//!
//! Polls the address registry until every expected peer has published an
//! address for the dispatched task, or the retry budget runs out. Running
//! out of budget is not an error: the caller gets whatever was found.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelSignal;
use crate::platform::{AddressQuery, AddressRegistry};
use crate::types::{AddressKey, PeerAddress, PeerId, ProbeRequest, TaskHandle};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// How the pause between registry polls evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollSchedule {
    /// Constant `poll_interval`
    #[default]
    Fixed,
    /// Doubling from `poll_interval`, capped at `max_poll_interval`
    Exponential,
}

impl PollSchedule {
    /// Pauses between successive polls, starting at `initial`
    pub fn intervals(self, initial: Duration, max: Duration) -> Box<dyn Backoff + Send> {
        match self {
            PollSchedule::Fixed => Box::new(Constant::new(initial)),
            PollSchedule::Exponential => {
                let mut backoff = ExponentialBackoff {
                    initial_interval: initial,
                    max_interval: max,
                    randomization_factor: 0.0,
                    multiplier: 2.0,
                    max_elapsed_time: None,
                    ..Default::default()
                };
                backoff.reset();
                Box::new(backoff)
            }
        }
    }
}

/// Parameters of the discovery loop
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub label: String,
    pub retry_budget: u32,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub schedule: PollSchedule,
}

impl DiscoveryConfig {
    /// Take label, budget and interval from a probe request
    pub fn for_request(request: &ProbeRequest, schedule: PollSchedule, max_poll_interval: Duration) -> Self {
        Self {
            label: request.label.clone(),
            retry_budget: request.retry_budget,
            poll_interval: request.poll_interval,
            max_poll_interval: max_poll_interval.max(request.poll_interval),
            schedule,
        }
    }

    fn intervals(&self) -> Box<dyn Backoff + Send> {
        self.schedule.intervals(self.poll_interval, self.max_poll_interval)
    }
}

// ─────────────────────────────────────────────────────────────────
// Discovery Result
// ─────────────────────────────────────────────────────────────────

/// Addresses found by one discovery run
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Distinct addresses in order of first appearance, at most one per expected peer
    pub addresses: Vec<PeerAddress>,

    /// Registry polls performed
    pub polls: u32,

    /// Every expected peer was found
    pub complete: bool,

    /// The loop stopped because of a cancel signal
    pub cancelled: bool,
}

impl Discovery {
    /// Address published by `peer`, if discovered
    pub fn address_of(&self, peer: PeerId) -> Option<&PeerAddress> {
        self.addresses.iter().find(|a| a.peer_id == peer)
    }
}

/// Deduplicating accumulator over successive polls
struct AddressBook<'a> {
    expected: &'a BTreeSet<PeerId>,
    seen: HashSet<AddressKey>,
    peers: HashSet<PeerId>,
    addresses: Vec<PeerAddress>,
}

impl<'a> AddressBook<'a> {
    fn new(expected: &'a BTreeSet<PeerId>) -> Self {
        Self {
            expected,
            seen: HashSet::new(),
            peers: HashSet::new(),
            addresses: Vec::new(),
        }
    }

    /// Merge one poll's answer; returns how many new addresses were accepted
    fn merge(&mut self, found: Vec<PeerAddress>, query: &AddressQuery) -> usize {
        let mut added = 0;
        for address in found {
            if self.is_full() {
                break;
            }
            if !query.matches(&address) || !self.expected.contains(&address.peer_id) {
                debug!(address = %address, "Ignoring address outside this probe round");
                continue;
            }
            if self.peers.contains(&address.peer_id) || !self.seen.insert(address.key()) {
                continue;
            }
            self.peers.insert(address.peer_id);
            self.addresses.push(address);
            added += 1;
        }
        added
    }

    fn is_full(&self) -> bool {
        self.addresses.len() >= self.expected.len()
    }
}

// ─────────────────────────────────────────────────────────────────
// Discovery Loop
// ─────────────────────────────────────────────────────────────────

/// Poll `registry` for the addresses of `expected` peers under `task`
///
/// Performs at most `config.retry_budget` polls. Registry errors are logged
/// and consume an attempt. A fired `cancel` signal stops the loop between
/// polls.
pub async fn discover_addresses(
    registry: &dyn AddressRegistry,
    task: TaskHandle,
    expected: &BTreeSet<PeerId>,
    config: &DiscoveryConfig,
    cancel: &mut CancelSignal,
) -> Discovery {
    let mut book = AddressBook::new(expected);
    let mut discovery = Discovery::default();

    if expected.is_empty() {
        discovery.complete = true;
        return discovery;
    }
    if cancel.is_cancelled() {
        discovery.cancelled = true;
        return discovery;
    }

    let query = AddressQuery::new(task.id, config.label.clone());
    let mut intervals = config.intervals();

    while discovery.polls < config.retry_budget {
        discovery.polls += 1;
        debug!(attempt = discovery.polls, task_id = %task.id, "Polling registry for peer addresses");

        match registry.query_addresses(&query).await {
            Ok(found) => {
                let added = book.merge(found, &query);
                if added > 0 {
                    info!(
                        attempt = discovery.polls,
                        found = book.addresses.len(),
                        expected = expected.len(),
                        "Discovered peer addresses"
                    );
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(attempt = discovery.polls, error = %e, "Registry poll failed");
            }
            Err(e) => {
                error!(attempt = discovery.polls, error = %e, "Registry returned an unusable listing");
            }
        }

        if book.is_full() {
            discovery.complete = true;
            break;
        }
        if discovery.polls >= config.retry_budget {
            break;
        }

        let delay = intervals.next_backoff().unwrap_or(config.max_poll_interval);
        if cancel.sleep(delay).await {
            info!(attempt = discovery.polls, "Discovery cancelled");
            discovery.cancelled = true;
            break;
        }
    }

    if !discovery.complete && !discovery.cancelled {
        warn!(
            polls = discovery.polls,
            found = book.addresses.len(),
            expected = expected.len(),
            "Cannot contact all peers within the retry budget"
        );
    }

    discovery.addresses = book.addresses;
    discovery
}
