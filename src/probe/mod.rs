//! Distributed peer-connectivity probe
//!
//! A probe round dispatches an echo task to every target peer, waits for
//! the peers to publish their echo address, and then performs one TCP echo
//! round-trip per discovered peer:
//!
//! ```text
//! submit_task ─► warm-up ─► discover_addresses (≤ retry_budget polls)
//!                                  │
//!                                  ▼
//!                   probe_echo per peer (bounded concurrency)
//!                                  │
//!                                  ▼
//!                  ProbeOutcome (one result per expected peer)
//! ```
//!
//! Every wait is bounded: polls by the retry budget, connect and read by
//! the probe timeout. Per-peer failures never abort the round; only a
//! rejected dispatch does.

mod coordinator;
mod discovery;
mod echo_client;

pub use coordinator::*;
pub use discovery::*;
pub use echo_client::*;
