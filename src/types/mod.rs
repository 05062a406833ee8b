//! Type definitions for v6-diagnostics
//!
//! Identifiers and addresses exchanged with the host platform, and the
//! request/result types of a probe round.

mod peer;
mod probe;

pub use peer::*;
pub use probe::*;
