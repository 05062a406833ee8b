//! Peer, task and address types
//!
//! These mirror the records the node's local proxy hands out: organizations
//! are identified by integer ids, tasks by integer ids, and published
//! algorithm ports by `(ip, port, label)`.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────

/// Identifier of a peer (the organization running a remote worker)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        PeerId(id)
    }
}

/// Opaque identifier of a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by the task system after a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: TaskId,
}

// ─────────────────────────────────────────────────────────────────
// Task Input
// ─────────────────────────────────────────────────────────────────

/// Input document of a remote task: the method to run and its keyword arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub method: String,

    #[serde(default, rename = "kwargs")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl TaskInput {
    /// Create an input without parameters
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            parameters: serde_json::Map::new(),
        }
    }

    /// Add a keyword argument
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Address
// ─────────────────────────────────────────────────────────────────

/// An address published by a peer once its echo service is bound
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Task the publishing worker runs for
    pub task_id: TaskId,

    /// Organization that published the address
    pub peer_id: PeerId,

    pub ip: String,
    pub port: u16,

    /// Port label from the algorithm image (e.g. "port8")
    pub label: String,
}

/// Identity of a published address; duplicates across polls share a key
pub type AddressKey = (TaskId, PeerId, String);

impl PeerAddress {
    /// Deduplication key for this address
    pub fn key(&self) -> AddressKey {
        (self.task_id, self.peer_id, self.label.clone())
    }

    /// "ip:port" form, bracketing IPv6 literals
    pub fn endpoint(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (peer {}, {})", self.endpoint(), self.peer_id, self.label)
    }
}
