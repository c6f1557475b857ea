//! reqwest-backed client for the agent's `/api/*` endpoints.

use std::time::Duration;

use familiar_core::config::HostCfg;
use familiar_core::types::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::{
    AgentConfig, ChatRequest, ChatResponse, ConnectStatus, SkillToggleResult, SkillsResponse,
    ToolsResponse,
};

const API_KEY_HEADER: &str = "X-API-Key";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
// LLM responses can be slow.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid base url: {0}")]
    InvalidUrl(String),
    #[error("{endpoint} failed: {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("bad response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        source: reqwest::Error,
    },
}

/// Client for one backend endpoint. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_timeouts(base_url, api_key, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        if reqwest::Url::parse(&base_url).is_err() {
            return Err(ClientError::InvalidUrl(base_url));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Client for the endpoint published with `Running`.
    pub fn from_connection(connection: &Connection, cfg: &HostCfg) -> Result<Self, ClientError> {
        Self::with_timeouts(
            &connection.base_url,
            &connection.credential,
            Duration::from_secs(cfg.client_connect_timeout_secs),
            Duration::from_secs(cfg.client_request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn chat(&self, message: &str) -> Result<ChatResponse, ClientError> {
        self.post_json("/api/chat", &ChatRequest { message }).await
    }

    pub async fn status(&self) -> Result<serde_json::Value, ClientError> {
        self.get_json("/api/status").await
    }

    pub async fn memory(&self) -> Result<serde_json::Value, ClientError> {
        self.get_json("/api/memory").await
    }

    pub async fn skills(&self) -> Result<SkillsResponse, ClientError> {
        self.get_json("/api/skills").await
    }

    pub async fn toggle_skill(&self, name: &str) -> Result<SkillToggleResult, ClientError> {
        let url = self.skill_toggle_url(name)?;
        let endpoint = url.path().to_owned();
        tracing::debug!(%endpoint, "agent api request");
        let resp = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        decode(&endpoint, resp).await
    }

    pub async fn tools(&self) -> Result<ToolsResponse, ClientError> {
        self.get_json("/api/tools").await
    }

    pub async fn config(&self) -> Result<AgentConfig, ClientError> {
        self.get_json("/api/config").await
    }

    pub async fn connect_status(&self) -> Result<ConnectStatus, ClientError> {
        self.get_json("/api/connect/status").await
    }

    /// Liveness check. Sends no credential; any failure reads as unhealthy.
    pub async fn is_healthy(&self) -> bool {
        match self.client.get(self.url("/api/status")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "health check failed");
                false
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn skill_toggle_url(&self, name: &str) -> Result<reqwest::Url, ClientError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["api", "skills", name, "toggle"]);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        tracing::debug!(endpoint = path, "agent api request");
        let resp = self
            .client
            .get(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        decode(path, resp).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        tracing::debug!(endpoint = path, "agent api request");
        let resp = self
            .client
            .post(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        decode(path, resp).await
    }
}

async fn decode<T: DeserializeOwned>(endpoint: &str, resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        tracing::warn!(endpoint, %status, "agent api error");
        return Err(ClientError::Status {
            endpoint: endpoint.to_owned(),
            status,
        });
    }
    resp.json().await.map_err(|source| ClientError::Decode {
        endpoint: endpoint.to_owned(),
        source,
    })
}
