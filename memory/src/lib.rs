//! Contract wrapper around the external semantic-memory service.
//!
//! The pipeline only depends on the observable contract captured by the
//! [`MemoryEngine`] trait: idempotent single and batch event writes, a
//! semantic query, a timeline snapshot fetch, and an enablement probe. Every
//! failure is typed as transient or permanent so the caller can decide what
//! counts against its circuit breaker; nothing in this crate retries on its
//! own.

mod http;

use async_trait::async_trait;
use codaph_protocol::EventEnvelope;
use codaph_protocol::format_ts;
pub use http::HttpMemoryEngine;
pub use http::MemoryEngineConfig;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Default namespace prefix for run ids.
pub const DEFAULT_RUN_ID_PREFIX: &str = "codaph";

/// Scope of the memory run a stream of events belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    /// One run per project: `"{prefix}:{projectId}"`.
    Project,
    /// One run per session: `"{prefix}:{projectId}:{sessionId}"`.
    Session,
}

/// Derive the engine's run id for a project and, in session scope, a session.
pub fn derive_run_id(prefix: &str, project_id: &str, session_id: Option<&str>) -> String {
    match session_id {
        Some(session) => format!("{prefix}:{project_id}:{session}"),
        None => format!("{prefix}:{project_id}"),
    }
}

/// Wire record for one event write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEventRecord {
    /// Equal to the envelope's event id; the engine deduplicates on it.
    pub idempotency_key: String,
    pub run_id: String,
    pub ts: String,
    pub event_type: String,
    pub payload: Value,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
}

impl MemoryEventRecord {
    pub fn from_envelope(env: &EventEnvelope, run_id: String, agent_id: String) -> Self {
        Self {
            idempotency_key: env.event_id.clone(),
            run_id,
            ts: format_ts(&env.ts),
            event_type: env.event_type.clone(),
            payload: env.payload.clone(),
            agent_id,
            actor_id: env.actor_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWriteReceipt {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplicated: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticQuery {
    pub run_id: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(
        default,
        rename = "directLane",
        skip_serializing_if = "Option::is_none"
    )]
    pub direct_lane: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub evidence: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_limit: Option<u32>,
    #[serde(default)]
    pub refresh: bool,
}

/// Opaque timeline records for a run, newest last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub timeline: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory engine call timed out")]
    Timeout,
    #[error("memory engine transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("memory engine returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
        /// Requested delay before the next attempt, from `Retry-After`.
        retry_after: Option<std::time::Duration>,
    },
    #[error("memory engine response did not match the expected schema: {0}")]
    Schema(#[from] serde_json::Error),
    #[error("memory engine is not enabled")]
    Disabled,
}

impl MemoryError {
    /// Transient failures (network, timeout, throttling, 5xx) may be retried
    /// and count against a circuit; permanent ones (auth, schema) should not
    /// be retried as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            MemoryError::Timeout => true,
            MemoryError::Transport(_) => true,
            MemoryError::Status { status, .. } => {
                *status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            MemoryError::Schema(_) | MemoryError::Disabled => false,
        }
    }

    /// The service's requested retry delay, when it sent one.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            MemoryError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// The observable contract of the external semantic-memory service.
#[async_trait]
pub trait MemoryEngine: Send + Sync {
    /// Runtime readiness: credentials present, transport constructed.
    fn is_enabled(&self) -> bool;

    /// Whether batched writes are available. The pipeline prefers the batch
    /// endpoint when they are.
    fn supports_batch(&self) -> bool {
        false
    }

    async fn write_event(&self, record: &MemoryEventRecord) -> Result<MemoryWriteReceipt>;

    /// Write several records in one call. The default falls back to
    /// sequential single writes for engines without batch support.
    async fn write_events_batch(
        &self,
        records: &[MemoryEventRecord],
    ) -> Result<Vec<MemoryWriteReceipt>> {
        let mut receipts = Vec::with_capacity(records.len());
        for record in records {
            receipts.push(self.write_event(record).await?);
        }
        Ok(receipts)
    }

    async fn query_semantic_context(&self, query: &SemanticQuery) -> Result<SemanticContext>;

    async fn fetch_context_snapshot(&self, request: &SnapshotRequest) -> Result<ContextSnapshot>;
}
