//! HTTP implementation of the memory engine contract.
//!
//! Requests are plain JSON POSTs with bearer auth. Error handling mirrors
//! the status triage the service documents: 429 and 5xx are throttling or
//! server trouble (transient), everything else in the 4xx range is a caller
//! bug or an auth problem (permanent), and error bodies are surfaced so the
//! operator sees the service's own message instead of a bare status code.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::trace;

use crate::ContextSnapshot;
use crate::MemoryEngine;
use crate::MemoryError;
use crate::MemoryEventRecord;
use crate::MemoryWriteReceipt;
use crate::Result;
use crate::SemanticContext;
use crate::SemanticQuery;
use crate::SnapshotRequest;

const EVENTS_PATH: &str = "/v1/memory/events";
const EVENTS_BATCH_PATH: &str = "/v1/memory/events/batch";
const QUERY_PATH: &str = "/v1/memory/query";
const SNAPSHOT_PATH: &str = "/v1/memory/snapshot";

#[derive(Debug, Clone)]
pub struct MemoryEngineConfig {
    /// Service base URL. An empty value means the engine is disabled.
    pub base_url: String,
    /// Bearer credential; absent means unauthenticated (local engines).
    pub api_token: Option<String>,
    /// Hard cap on any single HTTP exchange.
    pub request_timeout: Duration,
    /// Whether the deployment exposes the batch endpoint.
    pub batch_supported: bool,
}

impl MemoryEngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            request_timeout: Duration::from_secs(30),
            batch_supported: true,
        }
    }
}

pub struct HttpMemoryEngine {
    config: MemoryEngineConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    events: &'a [MemoryEventRecord],
}

#[derive(Deserialize)]
struct BatchResponse {
    results: Vec<MemoryWriteReceipt>,
}

impl HttpMemoryEngine {
    pub fn new(config: MemoryEngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(MemoryError::Transport)?;
        Ok(Self { config, client })
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        if !self.is_enabled() {
            return Err(MemoryError::Disabled);
        }
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        debug!(%url, "POST");

        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                MemoryError::Timeout
            } else {
                MemoryError::Transport(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            // Read the body so callers see the service's own error message.
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Status {
                status,
                body,
                retry_after,
            });
        }

        let text = response.text().await.map_err(MemoryError::Transport)?;
        trace!(bytes = text.len(), "memory engine response");
        serde_json::from_str(&text).map_err(MemoryError::Schema)
    }
}

#[async_trait]
impl MemoryEngine for HttpMemoryEngine {
    fn is_enabled(&self) -> bool {
        !self.config.base_url.is_empty()
    }

    fn supports_batch(&self) -> bool {
        self.config.batch_supported
    }

    async fn write_event(&self, record: &MemoryEventRecord) -> Result<MemoryWriteReceipt> {
        self.post_json(EVENTS_PATH, record).await
    }

    async fn write_events_batch(
        &self,
        records: &[MemoryEventRecord],
    ) -> Result<Vec<MemoryWriteReceipt>> {
        let response: BatchResponse = self
            .post_json(EVENTS_BATCH_PATH, &BatchRequest { events: records })
            .await?;
        Ok(response.results)
    }

    async fn query_semantic_context(&self, query: &SemanticQuery) -> Result<SemanticContext> {
        self.post_json(QUERY_PATH, query).await
    }

    async fn fetch_context_snapshot(&self, request: &SnapshotRequest) -> Result<ContextSnapshot> {
        self.post_json(SNAPSHOT_PATH, request).await
    }
}
