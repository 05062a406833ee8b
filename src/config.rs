//! Configuration system for v6-diagnostics
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (V6DIAG_* prefix, plus the container's HOST, PORT and TOKEN_FILE)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::echo::EchoConfig;
use crate::error::{Error, Result};
use crate::probe::{CoordinatorSettings, PollSchedule, PROBE_MESSAGE};
use crate::types::{PeerId, ProbeRequest};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Local proxy connection
    pub proxy: ProxySettings,

    /// Metadata of the echo task submitted to peers
    pub task: TaskSettings,

    /// Probe round timings
    pub probe: ProbeSettings,

    /// Echo server run on peers
    pub echo: EchoSettings,

    /// Base diagnostic checks
    pub diagnostics: CheckSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Local proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Proxy base URL without port
    pub host: String,

    /// Proxy port
    pub port: u16,

    /// File holding the bearer token for the proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

/// Echo task metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub name: String,
    pub description: String,

    /// Algorithm image run by the peers (defaults to the node's own)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collaboration_id: Option<u64>,

    /// Database label passed to the peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

/// Probe round settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Pause after dispatch before the first registry poll
    pub warmup_ms: u64,

    /// Pause between registry polls
    pub poll_interval_ms: u64,

    /// Cap on the pause for the exponential schedule
    pub max_poll_interval_ms: u64,

    /// Maximum registry polls per round
    pub retry_budget: u32,

    /// Connect and read timeout per echo probe
    pub timeout_ms: u64,

    /// Address label published by the echo server
    pub label: String,

    /// Maximum simultaneous echo probes
    pub concurrency: usize,

    /// Poll interval schedule: fixed or exponential
    pub schedule: PollSchedule,
}

/// Echo server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoSettings {
    pub bind_addr: String,
    pub port: u16,

    /// Time the server accepts connections, in milliseconds
    pub lifetime_ms: u64,

    /// Time a single client may stay silent before it is dropped
    pub read_timeout_ms: u64,

    /// Longest line echoed back
    pub max_line_bytes: usize,
}

/// Base diagnostic check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSettings {
    /// URL that must NOT be reachable from an isolated container
    pub isolation_url: String,

    /// Timeout for the isolation check in milliseconds
    pub isolation_timeout_ms: u64,

    /// Port labels the node is expected to expose
    pub expected_port_labels: Vec<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Log file rotation: daily, hourly or never
    pub rotation: String,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// ─────────────────────────────────────────────────────────────────
// Default implementations
// ─────────────────────────────────────────────────────────────────

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "http://localhost".to_string(),
            port: 80,
            token_file: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            name: "v6-diagnostics echo".to_string(),
            description: "Peer connectivity probe".to_string(),
            image: None,
            collaboration_id: None,
            database: None,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            warmup_ms: 5_000,
            poll_interval_ms: 4_000,
            max_poll_interval_ms: 30_000,
            retry_budget: 20,
            timeout_ms: 20_000,
            label: "port8".to_string(),
            concurrency: 8,
            schedule: PollSchedule::Fixed,
        }
    }
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8888,
            lifetime_ms: 20_000,
            read_timeout_ms: 5_000,
            max_line_bytes: 4096,
        }
    }
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            isolation_url: "https://google.nl".to_string(),
            isolation_timeout_ms: 10_000,
            expected_port_labels: vec!["port5".to_string(), "port8".to_string()],
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            rotation: "daily".to_string(),
            max_files: 5,
            json_format: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────

impl ProbeSettings {
    /// A probe request for `peers` with this section's timings
    pub fn request(&self, peers: impl IntoIterator<Item = PeerId>) -> ProbeRequest {
        let mut request = ProbeRequest::new(peers);
        request.timeout = Duration::from_millis(self.timeout_ms);
        request.retry_budget = self.retry_budget;
        request.poll_interval = Duration::from_millis(self.poll_interval_ms);
        request.warmup = Duration::from_millis(self.warmup_ms);
        request.label = self.label.clone();
        request
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            concurrency: self.concurrency,
            schedule: self.schedule,
            max_poll_interval: Duration::from_millis(self.max_poll_interval_ms),
            message: PROBE_MESSAGE.to_vec(),
        }
    }
}

impl EchoSettings {
    pub fn echo_config(&self) -> EchoConfig {
        EchoConfig {
            bind_addr: self.bind_addr.clone(),
            port: self.port,
            lifetime: Duration::from_millis(self.lifetime_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_line_bytes: self.max_line_bytes,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────

impl DiagnosticsConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        let search_paths = [
            PathBuf::from("v6-diagnostics.toml"),
            dirs::config_dir()
                .map(|p| p.join("v6-diagnostics").join("config.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".v6-diagnostics").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Container environment set by the node
        if let Ok(val) = std::env::var("HOST") {
            self.proxy.host = val;
        }
        if let Some(n) = env_parse("PORT") {
            self.proxy.port = n;
        }
        if let Ok(val) = std::env::var("TOKEN_FILE") {
            self.proxy.token_file = Some(val);
        }

        // Proxy settings
        if let Ok(val) = std::env::var("V6DIAG_PROXY_HOST") {
            self.proxy.host = val;
        }
        if let Some(n) = env_parse("V6DIAG_PROXY_PORT") {
            self.proxy.port = n;
        }
        if let Ok(val) = std::env::var("V6DIAG_TOKEN_FILE") {
            self.proxy.token_file = Some(val);
        }

        // Task settings
        if let Ok(val) = std::env::var("V6DIAG_TASK_IMAGE") {
            self.task.image = Some(val);
        }
        if let Some(n) = env_parse("V6DIAG_COLLABORATION_ID") {
            self.task.collaboration_id = Some(n);
        }
        if let Ok(val) = std::env::var("V6DIAG_DATABASE") {
            self.task.database = Some(val);
        }

        // Probe settings
        if let Some(n) = env_parse("V6DIAG_WARMUP_MS") {
            self.probe.warmup_ms = n;
        }
        if let Some(n) = env_parse("V6DIAG_POLL_INTERVAL_MS") {
            self.probe.poll_interval_ms = n;
        }
        if let Some(n) = env_parse("V6DIAG_RETRY_BUDGET") {
            self.probe.retry_budget = n;
        }
        if let Some(n) = env_parse("V6DIAG_PROBE_TIMEOUT_MS") {
            self.probe.timeout_ms = n;
        }
        if let Ok(val) = std::env::var("V6DIAG_ECHO_LABEL") {
            self.probe.label = val;
        }
        if let Some(n) = env_parse("V6DIAG_CONCURRENCY") {
            self.probe.concurrency = n;
        }
        if let Ok(val) = std::env::var("V6DIAG_POLL_SCHEDULE") {
            match val.to_lowercase().as_str() {
                "fixed" => self.probe.schedule = PollSchedule::Fixed,
                "exponential" => self.probe.schedule = PollSchedule::Exponential,
                _ => {}
            }
        }

        // Echo settings
        if let Ok(val) = std::env::var("V6DIAG_ECHO_BIND") {
            self.echo.bind_addr = val;
        }
        if let Some(n) = env_parse("V6DIAG_ECHO_PORT") {
            self.echo.port = n;
        }
        if let Some(n) = env_parse("V6DIAG_ECHO_LIFETIME_MS") {
            self.echo.lifetime_ms = n;
        }
        if let Some(n) = env_parse("V6DIAG_ECHO_READ_TIMEOUT_MS") {
            self.echo.read_timeout_ms = n;
        }

        // Diagnostic checks
        if let Ok(val) = std::env::var("V6DIAG_ISOLATION_URL") {
            self.diagnostics.isolation_url = val;
        }

        // Logging settings
        if let Ok(val) = std::env::var("V6DIAG_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("V6DIAG_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("V6DIAG_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.proxy.token_file {
            self.proxy.token_file = Some(expand_path(file));
        }
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.proxy.host.starts_with("http://") && !self.proxy.host.starts_with("https://") {
            return Err(Error::config_field_invalid(
                "proxy.host",
                format!("'{}' must start with http:// or https://", self.proxy.host),
            ));
        }
        if self.proxy.request_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "proxy.request_timeout_ms",
                "request_timeout_ms must be greater than 0",
            ));
        }

        if self.probe.retry_budget == 0 {
            return Err(Error::config_field_invalid(
                "probe.retry_budget",
                "retry_budget must be at least 1",
            ));
        }
        if self.probe.timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "probe.timeout_ms",
                "timeout_ms must be greater than 0",
            ));
        }
        if self.probe.concurrency == 0 {
            return Err(Error::config_field_invalid(
                "probe.concurrency",
                "concurrency must be at least 1",
            ));
        }
        if self.probe.label.is_empty() {
            return Err(Error::config_field_invalid("probe.label", "label cannot be empty"));
        }

        if self.echo.lifetime_ms == 0 {
            return Err(Error::config_field_invalid(
                "echo.lifetime_ms",
                "lifetime_ms must be greater than 0",
            ));
        }
        if self.echo.read_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "echo.read_timeout_ms",
                "read_timeout_ms must be greater than 0",
            ));
        }
        if self.echo.max_line_bytes == 0 {
            return Err(Error::config_field_invalid(
                "echo.max_line_bytes",
                "max_line_bytes must be greater than 0",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&self.logging.rotation.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.rotation",
                format!(
                    "Invalid rotation '{}'. Must be one of: {}",
                    self.logging.rotation,
                    valid_rotations.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".v6-diagnostics")
                .join("config.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# v6-diagnostics configuration

[proxy]
# Local proxy base URL (HOST in the algorithm container)
host = "http://localhost"

# Local proxy port (PORT in the algorithm container)
port = 80

# File with the bearer token for the proxy (TOKEN_FILE in the container)
# token_file = "/mnt/token"

# Per-request timeout in milliseconds
request_timeout_ms = 30000

[task]
# Name and description of the echo task sent to peers
name = "v6-diagnostics echo"
description = "Peer connectivity probe"

# Algorithm image run by the peers
# image = "harbor2.vantage6.ai/algorithms/diagnostic"

# collaboration_id = 1
# database = "default"

[probe]
# Wait after dispatch before the first registry poll
warmup_ms = 5000

# Pause between registry polls
poll_interval_ms = 4000

# Cap on the pause when schedule = "exponential"
max_poll_interval_ms = 30000

# Maximum registry polls per probe round
retry_budget = 20

# Connect and read timeout per echo probe
timeout_ms = 20000

# Address label published by the echo server
label = "port8"

# Maximum simultaneous echo probes
concurrency = 8

# fixed or exponential
schedule = "fixed"

[echo]
bind_addr = "0.0.0.0"
port = 8888

# How long the echo server accepts connections
lifetime_ms = 20000

# Silent clients are dropped after this long
read_timeout_ms = 5000

# Longest line echoed back
max_line_bytes = 4096

[diagnostics]
# Must NOT be reachable from an isolated algorithm container
isolation_url = "https://google.nl"
isolation_timeout_ms = 10000

# Port labels the node must expose, and nothing else
expected_port_labels = ["port5", "port8"]

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.v6-diagnostics/logs/v6-diagnostics.log"

# daily, hourly or never
rotation = "daily"

# Number of rotated log files to keep
max_files = 5

# Emit JSON log lines
json_format = false
"#
    .to_string()
}
