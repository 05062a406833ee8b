//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for v6-diagnostics.

use clap::{Parser, Subcommand};

/// v6-diagnostics - Connectivity diagnostics for vantage6 nodes
///
/// Runs inside an algorithm container to check the container environment,
/// the local proxy and the VPN links to peer nodes, or serves as the echo
/// endpoint those peers probe.
#[derive(Parser, Debug)]
#[command(name = "v6-diagnostics")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as an algorithm container (reads INPUT_FILE, writes OUTPUT_FILE)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "V6DIAG_CONFIG")]
        config: Option<String>,
    },

    /// Probe the VPN connection to peer organizations through the local proxy
    Probe {
        /// Path to configuration file
        #[arg(short, long, env = "V6DIAG_CONFIG")]
        config: Option<String>,

        /// Organization ids to probe (comma separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        peers: Vec<u64>,

        /// Maximum registry polls
        #[arg(long)]
        retry_budget: Option<u32>,

        /// Echo timeout per peer in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve the echo endpoint for a limited time
    Echo {
        /// Path to configuration file
        #[arg(short, long, env = "V6DIAG_CONFIG")]
        config: Option<String>,

        /// Address to bind
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on (0 picks a free port)
        #[arg(long)]
        port: Option<u16>,

        /// How long to accept connections, in milliseconds
        #[arg(long)]
        lifetime_ms: Option<u64>,
    },

    /// Run the base diagnostic checks against the container environment
    Diagnose {
        /// Path to configuration file
        #[arg(short, long, env = "V6DIAG_CONFIG")]
        config: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a full probe round against local echo servers
    Selftest {
        /// Path to configuration file
        #[arg(short, long, env = "V6DIAG_CONFIG")]
        config: Option<String>,

        /// Number of simulated peers
        #[arg(long, default_value = "3")]
        peers: u64,

        /// How many of those peers never publish an address
        #[arg(long, default_value = "0")]
        silent: u64,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long, env = "V6DIAG_CONFIG")]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long, env = "V6DIAG_CONFIG")]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["v6-diagnostics", "run", "--config", "diag.toml"]);
        match cli.command {
            Commands::Run { config } => assert_eq!(config, Some("diag.toml".to_string())),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_probe_peer_list() {
        let cli = Cli::parse_from(["v6-diagnostics", "probe", "--peers", "2,3,5", "--timeout-ms", "500"]);
        match cli.command {
            Commands::Probe {
                peers,
                timeout_ms,
                retry_budget,
                json,
                ..
            } => {
                assert_eq!(peers, vec![2, 3, 5]);
                assert_eq!(timeout_ms, Some(500));
                assert_eq!(retry_budget, None);
                assert!(!json);
            }
            _ => panic!("Expected Probe command"),
        }
    }

    #[test]
    fn test_probe_requires_peers() {
        assert!(Cli::try_parse_from(["v6-diagnostics", "probe"]).is_err());
    }

    #[test]
    fn test_echo_overrides() {
        let cli = Cli::parse_from(["v6-diagnostics", "echo", "--port", "0", "--lifetime-ms", "250"]);
        match cli.command {
            Commands::Echo {
                port,
                lifetime_ms,
                bind,
                ..
            } => {
                assert_eq!(port, Some(0));
                assert_eq!(lifetime_ms, Some(250));
                assert!(bind.is_none());
            }
            _ => panic!("Expected Echo command"),
        }
    }

    #[test]
    fn test_selftest_defaults() {
        let cli = Cli::parse_from(["v6-diagnostics", "selftest"]);
        match cli.command {
            Commands::Selftest { peers, silent, json, .. } => {
                assert_eq!(peers, 3);
                assert_eq!(silent, 0);
                assert!(!json);
            }
            _ => panic!("Expected Selftest command"),
        }
    }

    #[test]
    fn test_diagnose_json() {
        let cli = Cli::parse_from(["v6-diagnostics", "diagnose", "--json"]);
        assert!(matches!(cli.command, Commands::Diagnose { json: true, .. }));
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["v6-diagnostics", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::parse_from(["v6-diagnostics", "version", "--quiet"]);
        assert!(cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["v6-diagnostics", "config", "init", "--path", "/tmp/v6.toml", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert_eq!(path, Some("/tmp/v6.toml".to_string()));
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
