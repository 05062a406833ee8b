//! v6-diagnostics - Connectivity diagnostics for vantage6 nodes
//!
//! This is the main entry point for the v6-diagnostics binary. Inside an
//! algorithm container it runs the method named in the task input; on the
//! command line it probes peers, serves the echo endpoint or checks the
//! container environment directly.

mod algorithm;
mod cancel;
mod cli;
mod config;
mod diagnostics;
mod echo;
mod error;
mod logging;
mod platform;
mod probe;
mod selftest;
#[cfg(test)]
mod test_support;
mod types;
mod version;

use std::io::Write;

use clap::Parser;
use tracing::{error, info, warn};

use crate::cancel::{cancel_on_ctrl_c, CancelSignal};
use crate::cli::{Cli, Commands};
use crate::config::DiagnosticsConfig;
use crate::diagnostics::{render_diagnostics, render_outcome, run_base_features, ContainerEnv};
use crate::echo::EchoServer;
use crate::error::{Error, Result};
use crate::selftest::SelftestOptions;
use crate::types::{PeerId, ProbeOutcome};

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // Commands that don't need configuration
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        _ => {}
    }

    let config_path = match &cli.command {
        Commands::Run { config }
        | Commands::Probe { config, .. }
        | Commands::Echo { config, .. }
        | Commands::Diagnose { config, .. }
        | Commands::Selftest { config, .. } => config.clone(),
        Commands::Version | Commands::Config { .. } => None,
    };

    let config = match load_config(config_path.as_deref(), &cli.command) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive until all output is flushed
    let log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        "Starting v6-diagnostics"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("v6-diagnostics")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    let code = match runtime.block_on(run_command(cli.command, config)) {
        Ok(code) => code,
        Err(e) => {
            if e.is_fatal() {
                error!(error = %e.format_for_log(), "Command failed");
            } else {
                warn!(error = %e.format_for_log(), "Command interrupted");
            }
            eprint!("{}", e.format_for_terminal());
            e.exit_code()
        }
    };

    drop(runtime);
    drop(log_guards);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Load configuration and apply command-line overrides
fn load_config(path: Option<&str>, command: &Commands) -> Result<DiagnosticsConfig> {
    let mut config = DiagnosticsConfig::load(path)?;

    match command {
        Commands::Probe {
            retry_budget,
            timeout_ms,
            ..
        } => {
            if let Some(n) = retry_budget {
                config.probe.retry_budget = *n;
            }
            if let Some(n) = timeout_ms {
                config.probe.timeout_ms = *n;
            }
        }
        Commands::Echo {
            bind,
            port,
            lifetime_ms,
            ..
        } => {
            if let Some(addr) = bind {
                config.echo.bind_addr = addr.clone();
            }
            if let Some(p) = port {
                config.echo.port = *p;
            }
            if let Some(ms) = lifetime_ms {
                config.echo.lifetime_ms = *ms;
            }
        }
        _ => {}
    }

    config.validate()?;
    Ok(config)
}

/// Run a configured command; returns the process exit code
async fn run_command(command: Commands, config: DiagnosticsConfig) -> Result<i32> {
    let (handle, cancel) = CancelSignal::new();
    cancel_on_ctrl_c(handle);

    match command {
        Commands::Run { .. } => {
            let env = ContainerEnv::from_env();
            match algorithm::run_algorithm(&config, &env, cancel).await {
                Ok(()) => Ok(0),
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Algorithm failed");
                    eprintln!("Error: {:#}", e);
                    Ok(e.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(1))
                }
            }
        }
        Commands::Probe { peers, json, .. } => {
            let peers = peers.into_iter().map(PeerId).collect();
            let outcome = algorithm::probe_via_proxy(&config, peers, cancel).await?;
            print_outcome(&outcome, json)
        }
        Commands::Echo { .. } => {
            let server = EchoServer::bind(config.echo.echo_config()).await?;
            println!("Echo server listening on {}", server.local_addr()?);
            std::io::stdout().flush()?;

            let summary = server.serve(cancel).await;
            println!(
                "Echo server stopped ({:?}): {} connections, {} echoed",
                summary.stop_reason, summary.connections, summary.echoed
            );
            Ok(0)
        }
        Commands::Diagnose { json, .. } => {
            let results = run_base_features(&ContainerEnv::from_env(), &config).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print!("{}", render_diagnostics(&results));
            }
            Ok(0)
        }
        Commands::Selftest {
            peers, silent, json, ..
        } => {
            let options = SelftestOptions { peers, silent };
            let outcome = selftest::run_selftest(options, &config.probe, cancel).await?;
            print_outcome(&outcome, json)
        }
        Commands::Version | Commands::Config { .. } => Err(Error::Internal(
            "command does not need configuration".to_string(),
        )),
    }
}

/// Print a probe outcome; exit code 1 unless every peer was reachable
fn print_outcome(outcome: &ProbeOutcome, json: bool) -> Result<i32> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        print!("{}", render_outcome(outcome));
    }
    Ok(if outcome.all_reachable { 0 } else { 1 })
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: cli::ConfigSubcommand) -> Result<()> {
    use cli::ConfigSubcommand;

    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = DiagnosticsConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate { config } => match DiagnosticsConfig::load(config.as_deref()) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
