//! Plain-text rendering of diagnostic results and probe outcomes

use std::fmt::Write;

use crate::types::ProbeOutcome;

use super::DiagnosticResult;

fn status(success: bool) -> &'static str {
    if success {
        "ok"
    } else {
        "FAILED"
    }
}

/// One line per check, followed by the errors of failed checks
pub fn render_diagnostics(results: &[DiagnosticResult]) -> String {
    let width = results.iter().map(|r| r.name.len()).max().unwrap_or(0);
    let mut out = String::new();

    for result in results {
        let _ = writeln!(out, "  {:<width$}  {}", result.name, status(result.success), width = width);
    }

    let passed = results.iter().filter(|r| r.success).count();
    let _ = writeln!(out, "\n{}/{} checks passed", passed, results.len());

    for result in results.iter().filter(|r| !r.success) {
        if let Some(ref error) = result.error {
            let _ = writeln!(out, "  {}: {}", result.name, error);
        }
    }

    out
}

/// One line per peer with address, round-trip time or error
pub fn render_outcome(outcome: &ProbeOutcome) -> String {
    let mut out = String::new();

    if let Some(task_id) = outcome.task_id {
        let _ = writeln!(
            out,
            "Echo task {} ({} registry polls{})",
            task_id,
            outcome.polls,
            if outcome.discovery_complete { "" } else { ", discovery incomplete" }
        );
    }

    for result in &outcome.results {
        let address = result.address.as_deref().unwrap_or("-");
        let detail = match (result.round_trip_ms, result.error.as_deref()) {
            (Some(ms), _) => format!("{} ms", ms),
            (None, Some(error)) => error.to_string(),
            (None, None) => String::new(),
        };
        let _ = writeln!(
            out,
            "  peer {:<6} {:<7} {:<24} {}",
            result.peer_id.to_string(),
            status(result.reachable),
            address,
            detail
        );
    }

    let _ = writeln!(
        out,
        "\n{}/{} peers reachable",
        outcome.reachable_count(),
        outcome.results.len()
    );
    out
}
