//! Base diagnostic battery for algorithm containers
//!
//! Each check inspects one feature the node promises to an algorithm
//! container (mounted files, the local proxy, network isolation, exposed
//! ports, the database) and records its own failure. No check aborts the
//! battery.

mod checks;
mod report;

pub use checks::*;
pub use report::*;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::ProbeOutcome;

/// Name of the result wrapping a probe round
pub const VPN_CONNECTION: &str = "VPN connection";

/// Outcome of a single diagnostic check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiagnosticResult {
    pub fn new(name: impl Into<String>, success: bool, payload: Option<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            success,
            payload,
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// Wrap a probe round into a diagnostic result
pub fn vpn_diagnostic(outcome: &ProbeOutcome) -> DiagnosticResult {
    match serde_json::to_value(outcome) {
        Ok(payload) => DiagnosticResult::new(VPN_CONNECTION, outcome.all_reachable, Some(payload)),
        Err(e) => DiagnosticResult::failed(VPN_CONNECTION, e.to_string()),
    }
}

/// Variables the node sets in every algorithm container
#[derive(Debug, Clone, Default)]
pub struct ContainerEnv {
    pub input_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub token_file: Option<PathBuf>,
    pub temporary_folder: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub database_uri: Option<String>,

    /// Names of all variables present in the environment
    pub variables: Vec<String>,
}

impl ContainerEnv {
    /// Capture the current process environment
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        let mut variables: Vec<String> = std::env::vars_os()
            .filter_map(|(k, _)| k.into_string().ok())
            .collect();
        variables.sort();

        Self {
            input_file: var("INPUT_FILE").map(PathBuf::from),
            output_file: var("OUTPUT_FILE").map(PathBuf::from),
            token_file: var("TOKEN_FILE").map(PathBuf::from),
            temporary_folder: var("TEMPORARY_FOLDER").map(PathBuf::from),
            host: var("HOST"),
            port: var("PORT"),
            database_uri: var("DATABASE_URI"),
            variables,
        }
    }
}
