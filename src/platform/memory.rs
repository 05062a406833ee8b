//! In-process platform
//!
//! Implements [`TaskDispatcher`] and [`AddressRegistry`] over shared memory.
//! Used by the `selftest` command to run a full probe round against local
//! echo servers, and by tests to script partial availability, stale
//! addresses and registry hiccups.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{PeerAddress, PeerId, TaskHandle, TaskId, TaskInput};

use super::{AddressQuery, AddressRegistry, TaskDispatcher};

/// Where a peer will publish its echo address once a task reaches it
#[derive(Debug, Clone)]
pub struct PeerRoute {
    pub ip: String,
    pub port: u16,
    pub label: String,

    /// Registry poll (1-based) from which the address becomes visible
    pub visible_from_poll: u32,
}

/// A task accepted by the in-process dispatcher
#[derive(Debug, Clone)]
pub struct SubmittedTask {
    pub handle: TaskHandle,
    pub input: TaskInput,
    pub target_peers: BTreeSet<PeerId>,
}

#[derive(Debug, Clone)]
struct Publication {
    address: PeerAddress,
    visible_from_poll: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_task_id: u64,
    routes: HashMap<PeerId, Vec<PeerRoute>>,
    publications: Vec<Publication>,
    submitted: Vec<SubmittedTask>,
    polls: u32,
    reject_dispatch: Option<String>,
    failing_queries: u32,
    garbled_queries: u32,
}

/// Shared-memory task system and address registry
#[derive(Debug, Default)]
pub struct MemoryPlatform {
    state: RwLock<MemoryState>,
}

impl MemoryPlatform {
    /// Create an empty platform; task ids start at 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` publish an address whenever a task is dispatched to it
    pub fn route(&self, peer: PeerId, route: PeerRoute) {
        self.state.write().routes.entry(peer).or_default().push(route);
    }

    /// Publish an address directly, independent of any dispatch
    pub fn publish(&self, address: PeerAddress, visible_from_poll: u32) {
        self.state.write().publications.push(Publication {
            address,
            visible_from_poll,
        });
    }

    /// Reject every future submission with `message`
    pub fn reject_dispatch(&self, message: impl Into<String>) {
        self.state.write().reject_dispatch = Some(message.into());
    }

    /// Fail the next `count` registry queries
    pub fn fail_next_queries(&self, count: u32) {
        self.state.write().failing_queries = count;
    }

    /// Answer the next `count` registry queries with an unreadable listing
    pub fn garble_next_queries(&self, count: u32) {
        self.state.write().garbled_queries = count;
    }

    /// Number of registry queries served so far
    pub fn poll_count(&self) -> u32 {
        self.state.read().polls
    }

    /// Tasks accepted so far
    pub fn submitted_tasks(&self) -> Vec<SubmittedTask> {
        self.state.read().submitted.clone()
    }
}

#[async_trait]
impl TaskDispatcher for MemoryPlatform {
    async fn submit_task(
        &self,
        input: &TaskInput,
        target_peers: &BTreeSet<PeerId>,
    ) -> Result<TaskHandle> {
        let mut state = self.state.write();

        if let Some(message) = &state.reject_dispatch {
            return Err(Error::dispatch_failed(message.clone(), None));
        }

        state.next_task_id += 1;
        let handle = TaskHandle {
            id: TaskId(state.next_task_id),
        };

        let mut published = Vec::new();
        for peer in target_peers {
            if let Some(routes) = state.routes.get(peer) {
                for route in routes {
                    published.push(Publication {
                        address: PeerAddress {
                            task_id: handle.id,
                            peer_id: *peer,
                            ip: route.ip.clone(),
                            port: route.port,
                            label: route.label.clone(),
                        },
                        visible_from_poll: route.visible_from_poll,
                    });
                }
            }
        }

        debug!(task_id = %handle.id, publications = published.len(), "Task accepted in memory");
        state.publications.extend(published);
        state.submitted.push(SubmittedTask {
            handle,
            input: input.clone(),
            target_peers: target_peers.clone(),
        });

        Ok(handle)
    }
}

#[async_trait]
impl AddressRegistry for MemoryPlatform {
    async fn query_addresses(&self, query: &AddressQuery) -> Result<Vec<PeerAddress>> {
        let mut state = self.state.write();
        state.polls += 1;

        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(Error::registry_query("registry unavailable"));
        }
        if state.garbled_queries > 0 {
            state.garbled_queries -= 1;
            return Err(Error::malformed("address listing garbled"));
        }

        let poll = state.polls;
        Ok(state
            .publications
            .iter()
            .filter(|p| p.visible_from_poll <= poll && query.matches(&p.address))
            .map(|p| p.address.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(port: u16, visible_from_poll: u32) -> PeerRoute {
        PeerRoute {
            ip: "127.0.0.1".into(),
            port,
            label: "port8".into(),
            visible_from_poll,
        }
    }

    #[tokio::test]
    async fn test_dispatch_publishes_routed_peers() {
        let platform = MemoryPlatform::new();
        platform.route(PeerId(1), route(9001, 1));
        platform.route(PeerId(2), route(9002, 2));

        let peers: BTreeSet<PeerId> = [PeerId(1), PeerId(2), PeerId(3)].into_iter().collect();
        let handle = platform.submit_task(&TaskInput::new("RPC_echo"), &peers).await.unwrap();
        assert_eq!(handle.id, TaskId(1));

        let query = AddressQuery::new(handle.id, "port8");
        assert_eq!(platform.query_addresses(&query).await.unwrap().len(), 1);
        assert_eq!(platform.query_addresses(&query).await.unwrap().len(), 2);
        assert_eq!(platform.poll_count(), 2);
        assert_eq!(platform.submitted_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_dispatch() {
        let platform = MemoryPlatform::new();
        platform.reject_dispatch("collaboration closed");

        let peers: BTreeSet<PeerId> = [PeerId(1)].into_iter().collect();
        let err = platform.submit_task(&TaskInput::new("RPC_echo"), &peers).await.unwrap_err();
        assert!(matches!(err, Error::DispatchFailed { .. }));
        assert!(platform.submitted_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_failing_queries_count_as_polls() {
        let platform = MemoryPlatform::new();
        platform.fail_next_queries(1);

        let query = AddressQuery::new(TaskId(1), "port8");
        assert!(platform.query_addresses(&query).await.is_err());
        assert!(platform.query_addresses(&query).await.unwrap().is_empty());
        assert_eq!(platform.poll_count(), 2);
    }
}
