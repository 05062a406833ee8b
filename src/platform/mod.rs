//! Interfaces to the host platform
//!
//! The probe only needs two things from the platform: a way to submit a
//! task to a set of organizations, and a read-only view of the addresses
//! published for a task. Both are async traits so the coordinator can run
//! against the node's local proxy ([`ProxyClient`]) or an in-process
//! platform ([`MemoryPlatform`]).

mod memory;
mod proxy;

pub use memory::*;
pub use proxy::*;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{PeerAddress, PeerId, TaskHandle, TaskId, TaskInput};

// ─────────────────────────────────────────────────────────────────
// Address Query
// ─────────────────────────────────────────────────────────────────

/// Registry-side filter flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFilter {
    /// Only return addresses of tasks spawned by the calling task
    pub only_children: bool,
}

impl Default for AddressFilter {
    fn default() -> Self {
        Self { only_children: true }
    }
}

/// A registry lookup for one task and label
///
/// Implementations of [`AddressRegistry`] must only return addresses for
/// which [`AddressQuery::matches`] holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressQuery {
    pub task_id: TaskId,
    pub label: String,
    pub filter: AddressFilter,
}

impl AddressQuery {
    pub fn new(task_id: TaskId, label: impl Into<String>) -> Self {
        Self {
            task_id,
            label: label.into(),
            filter: AddressFilter::default(),
        }
    }

    /// Whether an address belongs to this query's task and label
    pub fn matches(&self, address: &PeerAddress) -> bool {
        address.task_id == self.task_id && address.label == self.label
    }
}

// ─────────────────────────────────────────────────────────────────
// Platform Traits
// ─────────────────────────────────────────────────────────────────

/// Submits tasks to remote workers
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Submit `input` to every peer in `target_peers`
    ///
    /// Returns once the task exists; the remote workers may not have
    /// started yet.
    async fn submit_task(
        &self,
        input: &TaskInput,
        target_peers: &BTreeSet<PeerId>,
    ) -> Result<TaskHandle>;
}

/// Read-only view of the addresses published by running tasks
#[async_trait]
pub trait AddressRegistry: Send + Sync {
    /// Addresses currently published that satisfy `query`
    async fn query_addresses(&self, query: &AddressQuery) -> Result<Vec<PeerAddress>>;
}
