//! HTTP client for the node's local proxy
//!
//! Algorithm containers reach the central server only through the proxy
//! the node runs next to them (`HOST`/`PORT` in the container environment).
//! The proxy takes care of encrypting task input; this client sends plain
//! base64-encoded JSON.

use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ProxySettings, TaskSettings};
use crate::error::{Error, Result};
use crate::types::{PeerAddress, PeerId, TaskHandle, TaskId, TaskInput};

use super::{AddressQuery, AddressRegistry, TaskDispatcher};

/// Path of the algorithm address listing on the proxy
pub const ADDRESSES_PATH: &str = "vpn/algorithm/addresses";

// ─────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateTaskRequest<'a> {
    name: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collaboration_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    organizations: Vec<OrganizationInput>,
}

#[derive(Debug, Serialize)]
struct OrganizationInput {
    id: PeerId,
    /// base64 of the JSON task input
    input: String,
}

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    id: TaskId,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    data: Vec<ResultRecord>,
}

#[derive(Debug, Deserialize)]
struct ResultRecord {
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AddressesResponse {
    #[serde(default)]
    addresses: Vec<PublishedAddress>,
}

/// An address record exactly as the proxy reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedAddress {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<PeerId>,
}

impl PublishedAddress {
    /// Convert into a [`PeerAddress`]; records without task or organization are unusable
    pub fn into_peer_address(self) -> Option<PeerAddress> {
        Some(PeerAddress {
            task_id: self.task_id?,
            peer_id: self.organization_id?,
            ip: self.ip,
            port: self.port,
            label: self.label,
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Proxy Client
// ─────────────────────────────────────────────────────────────────

/// Client for the local proxy, implementing both platform traits
#[derive(Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    request_timeout: Duration,
    task: TaskSettings,
}

impl ProxyClient {
    /// Build a client from configuration, reading the token file if configured
    pub fn new(proxy: &ProxySettings, task: &TaskSettings) -> Result<Self> {
        let base_url = base_url(&proxy.host, proxy.port)?;

        let token = match proxy.token_file.as_deref() {
            Some(path) => {
                let token = fs::read_to_string(path).map_err(|e| Error::IoRead {
                    path: path.into(),
                    source: e,
                })?;
                Some(token.trim().to_string())
            }
            None => None,
        };

        let request_timeout = Duration::from_millis(proxy.request_timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token,
            request_timeout,
            task: task.clone(),
        })
    }

    /// Use `task` as the metadata of tasks submitted from now on
    pub fn with_task(mut self, task: TaskSettings) -> Self {
        self.task = task;
        self
    }

    /// Base URL all requests are resolved against
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid proxy path '{}': {}", path, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn transport_error(&self, url: &Url, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::ConnectionTimeout {
                url: url.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            Error::connection_failed(url.as_str(), err.to_string())
        }
    }

    /// `GET /version`, returning the HTTP status
    pub async fn version_status(&self) -> Result<StatusCode> {
        let url = self.endpoint("version")?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;
        Ok(response.status())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        let url = self.endpoint(path)?;
        let response = self
            .authorize(self.http.get(url.clone()).query(params))
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::connection_failed(url.as_str(), format!("HTTP {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| Error::malformed(format!("Invalid response from {}: {}", url, e)))
    }

    /// `GET /task/{id}/status`, e.g. `pending`, `active` or `completed`
    pub async fn task_status(&self, id: TaskId) -> Result<String> {
        let body: TaskStatusResponse = self.get_json(&format!("task/{}/status", id), &[]).await?;
        Ok(body.status)
    }

    /// Results of a task, one per organization that reported back
    ///
    /// The proxy hands results over as base64-encoded JSON; entries without
    /// a result decode to `null`.
    pub async fn task_results(&self, id: TaskId) -> Result<Vec<Value>> {
        let body: ResultsResponse = self.get_json("result", &[("task_id", id.to_string())]).await?;
        body.data.into_iter().map(|record| decode_result(record.result)).collect()
    }

    /// Raw address listing with arbitrary query parameters
    pub async fn fetch_addresses(&self, params: &[(&str, &str)]) -> Result<Vec<PublishedAddress>> {
        let url = self.endpoint(ADDRESSES_PATH)?;
        let response = self
            .authorize(self.http.get(url.clone()).query(params))
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::registry_query(format!("HTTP {} from {}", status, url)));
        }

        let body: AddressesResponse = response
            .json()
            .await
            .map_err(|e| Error::malformed(format!("Invalid address listing: {}", e)))?;

        debug!(count = body.addresses.len(), "Fetched published addresses");
        Ok(body.addresses)
    }
}

#[async_trait]
impl TaskDispatcher for ProxyClient {
    async fn submit_task(
        &self,
        input: &TaskInput,
        target_peers: &BTreeSet<PeerId>,
    ) -> Result<TaskHandle> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(input)?);
        let body = CreateTaskRequest {
            name: &self.task.name,
            description: &self.task.description,
            image: self.task.image.as_deref(),
            collaboration_id: self.task.collaboration_id,
            database: self.task.database.as_deref(),
            organizations: target_peers
                .iter()
                .map(|&id| OrganizationInput {
                    id,
                    input: encoded.clone(),
                })
                .collect(),
        };

        let url = self.endpoint("task")?;
        info!(url = %url, method = %input.method, peers = ?target_peers, "Submitting task");

        let response = self
            .authorize(self.http.post(url.clone()).json(&body))
            .send()
            .await
            .map_err(|e| Error::dispatch_failed(format!("{}: {}", url, e), None))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(status = %status, detail = %detail, "Task submission rejected");
            return Err(Error::dispatch_failed(
                format!("HTTP {} from {}: {}", status, url, detail.trim()),
                Some(status.as_u16()),
            ));
        }

        let created: CreateTaskResponse = response
            .json()
            .await
            .map_err(|e| Error::dispatch_failed(format!("Unreadable task response: {}", e), None))?;

        Ok(TaskHandle { id: created.id })
    }
}

#[async_trait]
impl AddressRegistry for ProxyClient {
    async fn query_addresses(&self, query: &AddressQuery) -> Result<Vec<PeerAddress>> {
        let only_children = if query.filter.only_children { "true" } else { "false" };
        let published = self.fetch_addresses(&[("only_children", only_children)]).await?;

        Ok(published
            .into_iter()
            .filter_map(PublishedAddress::into_peer_address)
            .filter(|address| query.matches(address))
            .collect())
    }
}

/// Combine the proxy host and port into a base URL with a trailing slash
fn decode_result(result: Option<Value>) -> Result<Value> {
    match result {
        Some(Value::String(encoded)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::malformed(format!("Result is not base64: {}", e)))?;
            Ok(serde_json::from_slice(&bytes)?)
        }
        Some(other) => Ok(other),
        None => Ok(Value::Null),
    }
}

fn base_url(host: &str, port: u16) -> Result<Url> {
    let mut url = Url::parse(host)
        .map_err(|e| Error::config_field_invalid("proxy.host", format!("'{}': {}", host, e)))?;
    url.set_port(Some(port))
        .map_err(|_| Error::config_field_invalid("proxy.host", format!("'{}' cannot carry a port", host)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
