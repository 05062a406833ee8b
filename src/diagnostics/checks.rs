//! Individual container checks

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use backoff::backoff::Backoff;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{DiagnosticsConfig, ProxySettings, TaskSettings};
use crate::platform::{ProxyClient, TaskDispatcher};
use crate::types::{PeerId, TaskInput};

use super::{ContainerEnv, DiagnosticResult};

/// Method run by the subtask the base battery creates on its own node
pub const SUBTASK_STOP_METHOD: &str = "diagnose_local_proxy_subtask_stop";

const OUTPUT_PROBE: &str = "test";
const TEMPORARY_PROBE_FILE: &str = "test.txt";
const SQLITE_PREFIX: &str = "sqlite:///";
const SUBTASK_NAME: &str = "v6-diagnostics subtask";
const TASK_COMPLETED: &str = "completed";
/// Task states after which no result arrives
const TASK_FAILED: &[&str] = &[
    "failed",
    "crashed",
    "killed by user",
    "not allowed",
    "start failed",
    "no docker image",
];

/// What a check concluded when it ran to completion
struct Verdict {
    success: bool,
    payload: Option<Value>,
}

impl Verdict {
    fn pass(payload: Option<Value>) -> Self {
        Self { success: true, payload }
    }

    fn fail(payload: Option<Value>) -> Self {
        Self {
            success: false,
            payload,
        }
    }
}

fn record(name: &str, outcome: anyhow::Result<Verdict>) -> DiagnosticResult {
    let result = match outcome {
        Ok(verdict) => DiagnosticResult::new(name, verdict.success, verdict.payload),
        Err(e) => DiagnosticResult::failed(name, format!("{:#}", e)),
    };

    if result.success {
        info!(check = name, "Check passed");
    } else {
        warn!(check = name, error = ?result.error, "Check failed");
    }
    result
}

/// JSON truthiness: null, false, zero and empty values are false
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn required<'a, T>(value: &'a Option<T>, variable: &str) -> anyhow::Result<&'a T> {
    value.as_ref().ok_or_else(|| anyhow!("{} is not set", variable))
}

/// Run every base check in order
pub async fn run_base_features(env: &ContainerEnv, config: &DiagnosticsConfig) -> Vec<DiagnosticResult> {
    let proxy = proxy_client(env, config.proxy.request_timeout_ms);
    let checks = &config.diagnostics;

    vec![
        record("ENVIRONMENT", check_environment(env)),
        record("INPUT_FILE", check_input_file(env)),
        record("OUTPUT_FILE", check_output_file(env)),
        record("TOKEN_FILE", check_token_file(env)),
        record("TEMPORARY_VOLUME", check_temporary_volume(env)),
        record("TEMPORARY_VOLUME_FILE_EXISTS", check_temporary_file_exists(env)),
        record("LOCAL_PROXY", check_local_proxy(&proxy).await),
        record("CREATE_SUBTASK", check_subtask(&proxy, env, config).await),
        record(
            "ISOLATION",
            check_isolation(&checks.isolation_url, Duration::from_millis(checks.isolation_timeout_ms)).await,
        ),
        record(
            "EXTERNAL_PORT_TEST",
            check_external_ports(&proxy, &checks.expected_port_labels).await,
        ),
        record("DATABASE", check_database(env)),
    ]
}

/// Build a proxy client from the container's HOST, PORT and TOKEN_FILE
fn proxy_client(env: &ContainerEnv, request_timeout_ms: u64) -> anyhow::Result<ProxyClient> {
    let host = required(&env.host, "HOST")?;
    let port = required(&env.port, "PORT")?;
    let settings = ProxySettings {
        host: host.clone(),
        port: port.parse().with_context(|| format!("PORT '{}' is not a port number", port))?,
        token_file: env.token_file.as_ref().map(|p| p.to_string_lossy().into_owned()),
        request_timeout_ms,
    };
    Ok(ProxyClient::new(&settings, &TaskSettings::default())?)
}

// ─────────────────────────────────────────────────────────────────
// File Checks
// ─────────────────────────────────────────────────────────────────

fn check_environment(env: &ContainerEnv) -> anyhow::Result<Verdict> {
    Ok(Verdict::pass(Some(json!({ "variables": env.variables }))))
}

fn check_input_file(env: &ContainerEnv) -> anyhow::Result<Verdict> {
    let path = required(&env.input_file, "INPUT_FILE")?;
    let input = fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
    debug!(bytes = input.len(), "Read input file");

    Ok(Verdict::pass(Some(json!({
        "bytes": input.len(),
        "content": String::from_utf8_lossy(&input),
    }))))
}

fn check_output_file(env: &ContainerEnv) -> anyhow::Result<Verdict> {
    let path = required(&env.output_file, "OUTPUT_FILE")?;
    fs::write(path, OUTPUT_PROBE).with_context(|| format!("Cannot write {}", path.display()))?;
    let read_back = fs::read_to_string(path).with_context(|| format!("Cannot read back {}", path.display()))?;

    if read_back == OUTPUT_PROBE {
        Ok(Verdict::pass(None))
    } else {
        Ok(Verdict::fail(Some(json!({ "read_back": read_back }))))
    }
}

fn check_token_file(env: &ContainerEnv) -> anyhow::Result<Verdict> {
    let path = required(&env.token_file, "TOKEN_FILE")?;
    let token = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    let token = token.trim();

    Ok(Verdict {
        success: !token.is_empty(),
        payload: Some(json!({ "bytes": token.len() })),
    })
}

fn temporary_probe_path(env: &ContainerEnv) -> anyhow::Result<PathBuf> {
    Ok(required(&env.temporary_folder, "TEMPORARY_FOLDER")?.join(TEMPORARY_PROBE_FILE))
}

fn check_temporary_volume(env: &ContainerEnv) -> anyhow::Result<Verdict> {
    let path = temporary_probe_path(env)?;
    fs::write(&path, OUTPUT_PROBE).with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(Verdict::pass(None))
}

fn check_temporary_file_exists(env: &ContainerEnv) -> anyhow::Result<Verdict> {
    let path = temporary_probe_path(env)?;
    Ok(Verdict {
        success: path.exists(),
        payload: Some(json!({ "path": path.display().to_string() })),
    })
}

fn check_database(env: &ContainerEnv) -> anyhow::Result<Verdict> {
    let uri = required(&env.database_uri, "DATABASE_URI")?;
    let path = Path::new(uri.strip_prefix(SQLITE_PREFIX).unwrap_or(uri));

    Ok(Verdict {
        success: path.exists(),
        payload: Some(json!({ "path": path.display().to_string() })),
    })
}

// ─────────────────────────────────────────────────────────────────
// Network Checks
// ─────────────────────────────────────────────────────────────────

async fn check_local_proxy(proxy: &anyhow::Result<ProxyClient>) -> anyhow::Result<Verdict> {
    let proxy = proxy.as_ref().map_err(|e| anyhow!("{:#}", e))?;
    let status = proxy.version_status().await?;

    let payload = Some(json!({ "status": status.as_u16() }));
    if status.as_u16() == 200 {
        Ok(Verdict::pass(payload))
    } else {
        Ok(Verdict::fail(payload))
    }
}

/// Task identity carried in the `sub` claim of the container token
#[derive(Debug, Deserialize)]
struct TokenIdentity {
    organization_id: u64,
    #[serde(default)]
    collaboration_id: Option<u64>,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: TokenIdentity,
}

/// Read the identity claims of a JWT without verifying its signature
fn token_identity(token: &str) -> anyhow::Result<TokenIdentity> {
    let payload = token
        .trim()
        .split('.')
        .nth(1)
        .ok_or_else(|| anyhow!("Token is not a JWT"))?;
    let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("Token payload is not base64url")?;
    let claims: TokenClaims = serde_json::from_slice(&claims).context("Token carries no task identity")?;
    Ok(claims.sub)
}

/// Create a subtask on the node's own organization and wait for its result
///
/// Polls the task status with the probe's retry budget and schedule. Passes
/// when the task completes with only truthy results.
async fn check_subtask(
    proxy: &anyhow::Result<ProxyClient>,
    env: &ContainerEnv,
    config: &DiagnosticsConfig,
) -> anyhow::Result<Verdict> {
    let proxy = proxy.as_ref().map_err(|e| anyhow!("{:#}", e))?;
    let path = required(&env.token_file, "TOKEN_FILE")?;
    let token = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    let identity = token_identity(&token)?;

    let proxy = proxy.clone().with_task(TaskSettings {
        name: SUBTASK_NAME.to_string(),
        description: "Subtask created by the base diagnostics".to_string(),
        image: identity.image.or_else(|| config.task.image.clone()),
        collaboration_id: identity.collaboration_id.or(config.task.collaboration_id),
        database: config.task.database.clone(),
    });
    let own = BTreeSet::from([PeerId(identity.organization_id)]);
    let task = proxy.submit_task(&TaskInput::new(SUBTASK_STOP_METHOD), &own).await?;
    info!(task_id = %task.id, organization = identity.organization_id, "Subtask created");

    let probe = &config.probe;
    let max_interval = Duration::from_millis(probe.max_poll_interval_ms);
    let mut intervals = probe
        .schedule
        .intervals(Duration::from_millis(probe.poll_interval_ms), max_interval);

    let mut status = String::new();
    for poll in 1..=probe.retry_budget {
        status = proxy.task_status(task.id).await?;
        debug!(poll, status = %status, "Subtask status");
        if status == TASK_COMPLETED || TASK_FAILED.contains(&status.as_str()) {
            break;
        }
        if poll < probe.retry_budget {
            tokio::time::sleep(intervals.next_backoff().unwrap_or(max_interval)).await;
        }
    }

    if status != TASK_COMPLETED {
        return Ok(Verdict::fail(Some(json!({ "task_id": task.id, "status": status }))));
    }

    let results = proxy.task_results(task.id).await?;
    Ok(Verdict {
        success: !results.is_empty() && results.iter().all(truthy),
        payload: Some(json!({ "task_id": task.id, "results": results })),
    })
}

/// Passes only when `url` cannot be connected to
async fn check_isolation(url: &str, timeout: Duration) -> anyhow::Result<Verdict> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Cannot build HTTP client")?;

    match client.get(url).send().await {
        Err(e) if e.is_connect() || e.is_timeout() => {
            debug!(url, error = %e, "External URL unreachable");
            Ok(Verdict::pass(None))
        }
        Err(e) => Err(anyhow!(e).context(format!("Unexpected failure requesting {}", url))),
        Ok(response) => Ok(Verdict::fail(Some(json!({
            "url": url,
            "status": response.status().as_u16(),
        })))),
    }
}

/// Passes when the published labels are exactly `expected`
async fn check_external_ports(proxy: &anyhow::Result<ProxyClient>, expected: &[String]) -> anyhow::Result<Verdict> {
    let proxy = proxy.as_ref().map_err(|e| anyhow!("{:#}", e))?;
    let addresses = proxy
        .fetch_addresses(&[("include_parent", "true"), ("include_children", "true")])
        .await?;

    let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    let found: BTreeSet<&str> = addresses.iter().map(|a| a.label.as_str()).collect();

    let missing: Vec<&str> = expected.difference(&found).copied().collect();
    let unexpected: Vec<&str> = found.difference(&expected).copied().collect();
    if !unexpected.is_empty() {
        warn!(labels = ?unexpected, "Unexpected port labels published");
    }

    let payload = Some(json!({
        "addresses": addresses,
        "missing": missing,
        "unexpected": unexpected,
    }));

    if missing.is_empty() && unexpected.is_empty() {
        Ok(Verdict::pass(payload))
    } else {
        Ok(Verdict::fail(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{respond_once, respond_routes};
    use tempfile::TempDir;

    fn container(dir: &TempDir) -> ContainerEnv {
        let input = dir.path().join("input");
        let token = dir.path().join("token");
        let database = dir.path().join("default.sqlite");
        let temporary = dir.path().join("tmp");
        fs::write(&input, r#"{"method": "main"}"#).unwrap();
        fs::write(&token, "eyJhbGciOi.payload.sig\n").unwrap();
        fs::write(&database, b"").unwrap();
        fs::create_dir(&temporary).unwrap();

        ContainerEnv {
            input_file: Some(input),
            output_file: Some(dir.path().join("output")),
            token_file: Some(token),
            temporary_folder: Some(temporary),
            host: None,
            port: None,
            database_uri: Some(format!("sqlite:///{}", database.display())),
            variables: vec!["INPUT_FILE".into(), "OUTPUT_FILE".into()],
        }
    }

    #[test]
    fn test_file_checks_pass_in_prepared_container() {
        let dir = TempDir::new().unwrap();
        let env = container(&dir);

        assert!(check_environment(&env).unwrap().success);
        assert!(check_input_file(&env).unwrap().success);
        assert!(check_output_file(&env).unwrap().success);
        assert!(check_token_file(&env).unwrap().success);
        assert!(check_temporary_volume(&env).unwrap().success);
        assert!(check_temporary_file_exists(&env).unwrap().success);
        assert!(check_database(&env).unwrap().success);
        assert_eq!(fs::read_to_string(dir.path().join("output")).unwrap(), "test");
    }

    #[test]
    fn test_missing_variables_fail_individually() {
        let env = ContainerEnv::default();

        let result = record("INPUT_FILE", check_input_file(&env));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("INPUT_FILE is not set"));

        assert!(check_database(&env).is_err());
        assert!(check_temporary_volume(&env).is_err());
    }

    #[test]
    fn test_temporary_file_absent_before_write() {
        let dir = TempDir::new().unwrap();
        let env = container(&dir);
        assert!(!check_temporary_file_exists(&env).unwrap().success);
    }

    #[test]
    fn test_database_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut env = container(&dir);
        env.database_uri = Some("sqlite:////nonexistent/db.sqlite".to_string());
        assert!(!check_database(&env).unwrap().success);
    }

    #[test]
    fn test_empty_token_fails() {
        let dir = TempDir::new().unwrap();
        let env = container(&dir);
        fs::write(env.token_file.as_ref().unwrap(), "  \n").unwrap();
        assert!(!check_token_file(&env).unwrap().success);
    }

    #[tokio::test]
    async fn test_isolation_passes_when_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let verdict = check_isolation(&format!("http://127.0.0.1:{}", port), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(verdict.success);
    }

    #[tokio::test]
    async fn test_isolation_fails_when_reachable() {
        let (addr, _server) = respond_once("200 OK", "{}".to_string()).await;
        let verdict = check_isolation(&format!("http://{}", addr), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!verdict.success);
    }

    #[tokio::test]
    async fn test_proxy_checks() {
        let addresses = json!({
            "addresses": [
                {"ip": "10.76.0.2", "port": 41005, "label": "port5"},
                {"ip": "10.76.0.2", "port": 41008, "label": "port8"}
            ]
        });
        let (addr, server) = respond_routes(
            vec![
                ("/version", "200 OK", r#"{"version": "4.2.0"}"#.to_string()),
                ("/vpn/algorithm/addresses", "200 OK", addresses.to_string()),
            ],
            2,
        )
        .await;

        let dir = TempDir::new().unwrap();
        let mut env = container(&dir);
        env.host = Some("http://127.0.0.1".to_string());
        env.port = Some(addr.port().to_string());
        let proxy = proxy_client(&env, 5_000);

        assert!(check_local_proxy(&proxy).await.unwrap().success);

        let expected = vec!["port5".to_string(), "port8".to_string()];
        assert!(check_external_ports(&proxy, &expected).await.unwrap().success);

        let requests = server.await.unwrap();
        assert!(requests[1].contains("include_parent=true"));
        assert!(requests[1].to_ascii_lowercase().contains("authorization: bearer"));
    }

    #[tokio::test]
    async fn test_unexpected_port_label_fails() {
        let addresses = json!({
            "addresses": [
                {"ip": "10.76.0.2", "port": 41005, "label": "port5"},
                {"ip": "10.76.0.2", "port": 41008, "label": "port8"},
                {"ip": "10.76.0.2", "port": 41009, "label": "debug"}
            ]
        });
        let (addr, _server) = respond_once("200 OK", addresses.to_string()).await;

        let dir = TempDir::new().unwrap();
        let mut env = container(&dir);
        env.host = Some("http://127.0.0.1".to_string());
        env.port = Some(addr.port().to_string());
        let proxy = proxy_client(&env, 5_000);

        let expected = vec!["port5".to_string(), "port8".to_string()];
        let verdict = check_external_ports(&proxy, &expected).await.unwrap();
        assert!(!verdict.success);
        assert_eq!(verdict.payload.unwrap()["unexpected"][0], "debug");
    }

    #[tokio::test]
    async fn test_battery_runs_every_check_without_proxy() {
        let dir = TempDir::new().unwrap();
        let env = container(&dir);
        let mut config = DiagnosticsConfig::default();
        config.diagnostics.isolation_url = "http://127.0.0.1:1".to_string();
        config.diagnostics.isolation_timeout_ms = 2_000;

        let results = run_base_features(&env, &config).await;
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ENVIRONMENT",
                "INPUT_FILE",
                "OUTPUT_FILE",
                "TOKEN_FILE",
                "TEMPORARY_VOLUME",
                "TEMPORARY_VOLUME_FILE_EXISTS",
                "LOCAL_PROXY",
                "CREATE_SUBTASK",
                "ISOLATION",
                "EXTERNAL_PORT_TEST",
                "DATABASE",
            ]
        );

        let local_proxy = &results[6];
        assert!(!local_proxy.success);
        assert_eq!(local_proxy.error.as_deref(), Some("HOST is not set"));
        assert_eq!(results[7].error.as_deref(), Some("HOST is not set"));
        assert!(results[5].success);
        assert!(results[10].success);
    }

    fn jwt(claims: Value) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.signature",
            engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
            engine.encode(claims.to_string())
        )
    }

    fn subtask_setup(dir: &TempDir, addr: std::net::SocketAddr) -> (ContainerEnv, DiagnosticsConfig) {
        let mut env = container(dir);
        env.host = Some("http://127.0.0.1".to_string());
        env.port = Some(addr.port().to_string());
        let claims = json!({
            "sub": {"organization_id": 3, "collaboration_id": 1, "image": "diagnostics:latest"}
        });
        fs::write(env.token_file.as_ref().unwrap(), jwt(claims)).unwrap();

        let mut config = DiagnosticsConfig::default();
        config.probe.poll_interval_ms = 10;
        config.probe.retry_budget = 3;
        (env, config)
    }

    #[test]
    fn test_token_identity_from_claims() {
        let identity = token_identity(&jwt(json!({"sub": {"organization_id": 7}}))).unwrap();
        assert_eq!(identity.organization_id, 7);
        assert_eq!(identity.collaboration_id, None);

        assert!(token_identity("opaque-token").is_err());
        assert!(token_identity(&jwt(json!({"sub": "node"}))).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!({"ok": 1})));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
    }

    #[tokio::test]
    async fn test_subtask_runs_on_own_organization() {
        let result = base64::engine::general_purpose::STANDARD.encode(b"true");
        let (addr, server) = respond_routes(
            vec![
                ("/task/41/status", "200 OK", r#"{"status": "completed"}"#.to_string()),
                ("/task", "201 CREATED", r#"{"id": 41}"#.to_string()),
                ("/result", "200 OK", json!({"data": [{"result": result}]}).to_string()),
            ],
            3,
        )
        .await;
        let dir = TempDir::new().unwrap();
        let (env, config) = subtask_setup(&dir, addr);
        let proxy = proxy_client(&env, 5_000);

        let verdict = check_subtask(&proxy, &env, &config).await.unwrap();
        assert!(verdict.success);
        assert_eq!(verdict.payload.unwrap()["results"], json!([true]));

        let requests = server.await.unwrap();
        let body = requests[0].split("\r\n\r\n").nth(1).unwrap();
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["organizations"][0]["id"], 3);
        assert_eq!(body["collaboration_id"], 1);
        assert_eq!(body["image"], "diagnostics:latest");

        let input = base64::engine::general_purpose::STANDARD
            .decode(body["organizations"][0]["input"].as_str().unwrap())
            .unwrap();
        let input: TaskInput = serde_json::from_slice(&input).unwrap();
        assert_eq!(input.method, SUBTASK_STOP_METHOD);
        assert!(requests[2].starts_with("GET /result?task_id=41"));
    }

    #[tokio::test]
    async fn test_subtask_failed_state_fails_check() {
        let (addr, _server) = respond_routes(
            vec![
                ("/task/41/status", "200 OK", r#"{"status": "crashed"}"#.to_string()),
                ("/task", "201 CREATED", r#"{"id": 41}"#.to_string()),
            ],
            2,
        )
        .await;
        let dir = TempDir::new().unwrap();
        let (env, config) = subtask_setup(&dir, addr);
        let proxy = proxy_client(&env, 5_000);

        let verdict = check_subtask(&proxy, &env, &config).await.unwrap();
        assert!(!verdict.success);
        assert_eq!(verdict.payload.unwrap()["status"], "crashed");
    }

    #[tokio::test]
    async fn test_subtask_gives_up_after_budget() {
        let (addr, server) = respond_routes(
            vec![
                ("/task/41/status", "200 OK", r#"{"status": "active"}"#.to_string()),
                ("/task", "201 CREATED", r#"{"id": 41}"#.to_string()),
            ],
            4,
        )
        .await;
        let dir = TempDir::new().unwrap();
        let (env, config) = subtask_setup(&dir, addr);
        let proxy = proxy_client(&env, 5_000);

        let verdict = check_subtask(&proxy, &env, &config).await.unwrap();
        assert!(!verdict.success);
        assert_eq!(verdict.payload.unwrap()["status"], "active");

        let requests = server.await.unwrap();
        let polls = requests.iter().filter(|r| r.starts_with("GET /task/41/status")).count();
        assert_eq!(polls, 3);
    }
}
