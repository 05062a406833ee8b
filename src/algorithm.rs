//! Algorithm container entrypoint
//!
//! The node starts the container with `INPUT_FILE` holding a JSON document
//! `{"method": ..., "kwargs": {...}}` and collects whatever is written to
//! `OUTPUT_FILE` as the task result.

use std::fs;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tracing::info;

use crate::cancel::CancelSignal;
use crate::config::DiagnosticsConfig;
use crate::diagnostics::{
    run_base_features, vpn_diagnostic, ContainerEnv, DiagnosticResult, SUBTASK_STOP_METHOD, VPN_CONNECTION,
};
use crate::echo::run_echo_service;
use crate::error::{Error, Result};
use crate::platform::ProxyClient;
use crate::probe::{ProbeCoordinator, ECHO_METHOD};
use crate::types::{PeerId, ProbeOutcome, TaskInput};

/// Keyword argument listing the organizations to probe
pub const OTHER_NODES: &str = "other_nodes";

/// Read the task input, run the requested method and write its result
pub async fn run_algorithm(config: &DiagnosticsConfig, env: &ContainerEnv, cancel: CancelSignal) -> anyhow::Result<()> {
    let input_path = env.input_file.as_ref().context("INPUT_FILE is not set")?;
    let output_path = env.output_file.as_ref().context("OUTPUT_FILE is not set")?;

    let raw = fs::read(input_path).with_context(|| format!("Failed to read {}", input_path.display()))?;
    let input: TaskInput = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not a {{method, kwargs}} document", input_path.display()))?;

    info!(method = %input.method, "Running algorithm method");
    let output = execute(config, env, &input, cancel).await?;

    fs::write(output_path, serde_json::to_vec(&output)?)
        .with_context(|| format!("Failed to write {}", output_path.display()))?;
    info!(path = %output_path.display(), "Result written");
    Ok(())
}

/// Dispatch a task input to its method
pub async fn execute(
    config: &DiagnosticsConfig,
    env: &ContainerEnv,
    input: &TaskInput,
    cancel: CancelSignal,
) -> Result<Value> {
    match input.method.as_str() {
        "main" | "base_features" => {
            let results = run_base_features(env, config).await;
            Ok(serde_json::to_value(results)?)
        }
        "diagnose_vpn_connection" => {
            let peers = other_nodes(input)?;
            let diagnostic = match probe_via_proxy(config, peers, cancel).await {
                Ok(outcome) => vpn_diagnostic(&outcome),
                Err(e) => DiagnosticResult::failed(VPN_CONNECTION, e.to_string()),
            };
            Ok(serde_json::to_value(diagnostic)?)
        }
        ECHO_METHOD => {
            let summary = run_echo_service(config.echo.echo_config(), cancel).await?;
            Ok(serde_json::to_value(summary)?)
        }
        SUBTASK_STOP_METHOD => Ok(Value::Bool(true)),
        other => Err(Error::UnknownMethod {
            method: other.to_string(),
        }),
    }
}

/// Run a probe round through the local proxy
pub async fn probe_via_proxy(
    config: &DiagnosticsConfig,
    peers: Vec<PeerId>,
    cancel: CancelSignal,
) -> Result<ProbeOutcome> {
    let client = Arc::new(ProxyClient::new(&config.proxy, &config.task)?);
    let coordinator = ProbeCoordinator::new(client.clone(), client, config.probe.coordinator_settings());
    coordinator.run(&config.probe.request(peers), cancel).await
}

fn other_nodes(input: &TaskInput) -> Result<Vec<PeerId>> {
    let malformed = || Error::malformed(format!("kwargs.{} must be a list of organization ids", OTHER_NODES));

    input
        .parameters
        .get(OTHER_NODES)
        .and_then(Value::as_array)
        .ok_or_else(malformed)?
        .iter()
        .map(|v| v.as_u64().map(PeerId).ok_or_else(malformed))
        .collect()
}
