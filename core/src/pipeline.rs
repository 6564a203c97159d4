//! The ingest pipeline: normalises raw observations into canonical
//! envelopes, redacts them, appends them to the mirror and publishes them to
//! the memory engine.
//!
//! The mirror is authoritative: a mirror failure fails the ingest call.
//! Everything on the memory side (timeouts, retries, batching, the circuit
//! breaker) is best-effort and absorbed; the caller learns about memory
//! trouble only through the error callback.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use codaph_memory::MemoryEngine;
use codaph_memory::MemoryError;
use codaph_memory::MemoryEventRecord;
use codaph_memory::RunScope;
use codaph_memory::derive_run_id;
use codaph_mirror::AppendOutcome;
use codaph_mirror::MirrorStore;
use codaph_protocol::EventEnvelope;
use codaph_protocol::EventSource;
use codaph_protocol::ItemPayload;
use codaph_protocol::ReasoningAvailability;
use codaph_protocol::compute_event_id;
use codaph_protocol::event_types;
use codaph_protocol::parse_ts;
use codaph_redact::redact_raw_line;
use codaph_redact::redact_tree;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::circuit::CircuitBreaker;
use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::error::Result;
use crate::util::backoff;

pub type MemoryErrorHandler = Box<dyn Fn(&MemoryError) + Send + Sync>;

/// Caller-supplied metadata for one ingested event.
#[derive(Debug, Clone)]
pub struct IngestMeta {
    pub source: EventSource,
    pub repo_id: String,
    pub session_id: String,
    /// Defaults to the session id when absent.
    pub thread_id: Option<String>,
    pub actor_id: Option<String>,
    /// Upstream timestamp, if any. Unparseable values fall back to the
    /// ingest clock.
    pub ts: Option<String>,
    /// Must be strictly greater than the last sequence observed for
    /// `(repo_id, session_id)`.
    pub sequence: u64,
    /// Pre-assigned identity; computed from content when absent.
    pub event_id: Option<String>,
}

impl IngestMeta {
    pub fn new(
        source: EventSource,
        repo_id: impl Into<String>,
        session_id: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            source,
            repo_id: repo_id.into(),
            session_id: session_id.into(),
            thread_id: None,
            actor_id: None,
            ts: None,
            sequence,
            event_id: None,
        }
    }
}

struct PipelineState {
    /// Last sequence accepted per `(repoId, sessionId)`, seeded from the
    /// sparse index on first touch.
    seq_tails: HashMap<(String, String), u64>,
    circuit: CircuitBreaker,
    batch: Vec<MemoryEventRecord>,
    last_enqueue: Instant,
}

struct PipelineInner {
    config: PipelineConfig,
    mirror: Arc<StdMutex<MirrorStore>>,
    memory: Option<Arc<dyn MemoryEngine>>,
    on_memory_error: StdMutex<Option<MemoryErrorHandler>>,
    state: Mutex<PipelineState>,
}

/// The event-ingest hub. Clones share one append lane and one circuit.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Build a pipeline over an opened mirror and an optional memory engine.
    ///
    /// Must be called from within a tokio runtime when batching is enabled:
    /// the bounded idle flusher runs as a background task.
    pub fn new(
        config: PipelineConfig,
        mirror: MirrorStore,
        memory: Option<Arc<dyn MemoryEngine>>,
    ) -> Self {
        let circuit = CircuitBreaker::new(
            config.memory_max_consecutive_errors,
            config.memory_circuit_cooldown,
        );
        let batching = config.memory_batch_size > 1 && memory.is_some();
        let inner = Arc::new(PipelineInner {
            config,
            mirror: Arc::new(StdMutex::new(mirror)),
            memory,
            on_memory_error: StdMutex::new(None),
            state: Mutex::new(PipelineState {
                seq_tails: HashMap::new(),
                circuit,
                batch: Vec::new(),
                last_enqueue: Instant::now(),
            }),
        });

        if batching && tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(idle_flush_loop(Arc::downgrade(&inner)));
        }

        Self { inner }
    }

    /// Install the side channel invoked for absorbed memory failures.
    pub fn set_memory_error_handler(
        &self,
        handler: impl Fn(&MemoryError) + Send + Sync + 'static,
    ) {
        *lock_std(&self.inner.on_memory_error) = Some(Box::new(handler));
    }

    /// Shared handle to the underlying mirror, for read-side services.
    pub fn mirror(&self) -> Arc<StdMutex<MirrorStore>> {
        self.inner.mirror.clone()
    }

    /// Where a history-sync source keeps its cursors for a repo.
    pub fn history_state_path(&self, repo_id: &str, source_name: &str) -> PathBuf {
        lock_std(&self.inner.mirror).history_state_path(repo_id, source_name)
    }

    /// Ingest one observation. Returns the canonical envelope whether or not
    /// the memory publish happened.
    pub async fn ingest(
        &self,
        event_type: &str,
        payload: Value,
        meta: IngestMeta,
    ) -> Result<EventEnvelope> {
        validate_meta(&meta)?;

        let redacted = redact_tree(&payload);
        let reasoning_availability = derive_reasoning_availability(event_type, &redacted);
        let ts = meta
            .ts
            .as_deref()
            .and_then(parse_ts)
            .unwrap_or_else(Utc::now);
        let event_id = meta.event_id.clone().unwrap_or_else(|| {
            compute_event_id(
                &meta.repo_id,
                &meta.session_id,
                meta.sequence,
                event_type,
                &redacted,
                &ts,
            )
        });

        let env = EventEnvelope {
            event_id,
            source: meta.source,
            repo_id: meta.repo_id,
            actor_id: meta.actor_id,
            session_id: meta.session_id.clone(),
            thread_id: meta.thread_id.or(Some(meta.session_id)),
            ts,
            sequence: meta.sequence,
            event_type: event_type.to_string(),
            payload: redacted,
            reasoning_availability,
        };

        let mut state = self.inner.state.lock().await;

        let key = (env.repo_id.clone(), env.session_id.clone());
        let last = match state.seq_tails.get(&key) {
            Some(last) => *last,
            None => {
                let mirror = self.inner.mirror.clone();
                let (repo_id, session_id) = key.clone();
                let last = tokio::task::spawn_blocking(move || {
                    lock_std(&mirror).last_sequence(&repo_id, &session_id)
                })
                .await??;
                state.seq_tails.insert(key.clone(), last);
                last
            }
        };
        if env.sequence <= last {
            // A stale sequence is fine when it is the same observation coming
            // around again; only genuinely new events are out of order.
            let already_present = {
                let mirror = self.inner.mirror.clone();
                let (repo_id, session_id) = key.clone();
                let event_id = env.event_id.clone();
                tokio::task::spawn_blocking(move || {
                    lock_std(&mirror).contains_event(&repo_id, &session_id, &event_id)
                })
                .await??
            };
            if !already_present {
                return Err(IngestError::OutOfOrderSequence {
                    session_id: env.session_id,
                    got: env.sequence,
                    last,
                });
            }
        }

        let outcome = {
            let mirror = self.inner.mirror.clone();
            let to_append = env.clone();
            tokio::task::spawn_blocking(move || lock_std(&mirror).append_event(&to_append))
                .await??
        };
        if env.sequence > last {
            state.seq_tails.insert(key, env.sequence);
        }

        self.maybe_publish(&mut state, &env, &outcome).await;
        Ok(env)
    }

    /// Redact one verbatim upstream line and append it to the session's raw
    /// mirror. Creates no envelope and never touches the memory engine.
    pub async fn ingest_raw_line(&self, session_id: &str, raw_line: &str) -> Result<()> {
        if session_id.trim().is_empty() {
            return Err(IngestError::InvalidInput(
                "sessionId is required for raw lines".to_string(),
            ));
        }
        let line = redact_raw_line(raw_line);
        let mirror = self.inner.mirror.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || lock_std(&mirror).append_raw_line(&session_id, &line))
            .await??;
        Ok(())
    }

    /// Drain the memory batch and force a mirror commit group.
    pub async fn flush(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            self.flush_batch(&mut state).await;
        }
        let mirror = self.inner.mirror.clone();
        tokio::task::spawn_blocking(move || lock_std(&mirror).flush()).await??;
        Ok(())
    }

    /// Final flush on shutdown: memory batch, then manifest fsync.
    pub async fn shutdown(&self) -> Result<()> {
        self.flush().await
    }

    /// Whether the memory circuit is currently open.
    pub async fn memory_circuit_open(&self) -> bool {
        self.inner.state.lock().await.circuit.is_open()
    }

    async fn maybe_publish(
        &self,
        state: &mut PipelineState,
        env: &EventEnvelope,
        outcome: &AppendOutcome,
    ) {
        let Some(memory) = self.inner.memory.clone() else {
            return;
        };
        if !memory.is_enabled() {
            return;
        }
        if outcome.deduplicated && !self.inner.config.retry_memory_write_on_local_dedup {
            debug!(event_id = %env.event_id, "locally deduplicated; skipping memory write");
            return;
        }
        if state.circuit.should_skip() {
            debug!(event_id = %env.event_id, "memory circuit open; skipping write");
            return;
        }

        let config = &self.inner.config;
        let session = match config.run_scope {
            RunScope::Session => Some(env.session_id.as_str()),
            RunScope::Project => None,
        };
        let run_id = derive_run_id(&config.run_id_prefix, &config.project_id, session);
        let record = MemoryEventRecord::from_envelope(env, run_id, config.agent_id.clone());

        if config.memory_batch_size > 1 && memory.supports_batch() {
            state.batch.push(record);
            state.last_enqueue = Instant::now();
            if state.batch.len() >= config.memory_batch_size {
                self.flush_batch(state).await;
            }
        } else {
            self.write_single(state, &*memory, record).await;
        }
    }

    async fn write_single(
        &self,
        state: &mut PipelineState,
        memory: &dyn MemoryEngine,
        record: MemoryEventRecord,
    ) {
        let config = &self.inner.config;
        let max_attempts = u64::from(config.memory_write_max_retries) + 1;
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let result = bounded(config.memory_write_timeout, memory.write_event(&record)).await;
            match result {
                Ok(receipt) => {
                    state.circuit.record_success();
                    if receipt.deduplicated == Some(true) {
                        debug!(
                            idempotency_key = %record.idempotency_key,
                            "memory engine deduplicated the write"
                        );
                    }
                    return;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    debug!(attempt, error = %e, "transient memory failure; retrying");
                    let delay = e.retry_after().unwrap_or_else(|| backoff(attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    state.circuit.record_transient();
                    self.report_memory_error(&e);
                    return;
                }
                Err(e) => {
                    state.circuit.record_permanent();
                    self.report_memory_error(&e);
                    return;
                }
            }
        }
    }

    async fn flush_batch(&self, state: &mut PipelineState) {
        if state.batch.is_empty() {
            return;
        }
        let Some(memory) = self.inner.memory.clone() else {
            state.batch.clear();
            return;
        };
        let records = std::mem::take(&mut state.batch);
        let result = bounded(
            self.inner.config.memory_write_timeout,
            memory.write_events_batch(&records),
        )
        .await;
        match result {
            Ok(receipts) => {
                state.circuit.record_success();
                debug!(count = receipts.len(), "memory batch flushed");
            }
            Err(e) => {
                if e.is_transient() {
                    state.circuit.record_transient();
                } else {
                    state.circuit.record_permanent();
                }
                warn!(dropped = records.len(), error = %e, "memory batch write failed");
                self.report_memory_error(&e);
            }
        }
    }

    fn report_memory_error(&self, error: &MemoryError) {
        if let Some(handler) = &*lock_std(&self.inner.on_memory_error) {
            handler(error);
        }
    }
}

/// Background task draining partially filled batches after an idle period.
async fn idle_flush_loop(inner: Weak<PipelineInner>) {
    loop {
        let idle = {
            let Some(inner) = inner.upgrade() else { return };
            inner.config.memory_flush_idle
        };
        tokio::time::sleep(idle.max(Duration::from_millis(50)) / 2).await;

        let Some(inner) = inner.upgrade() else { return };
        let pipeline = Pipeline { inner };
        let mut state = pipeline.inner.state.lock().await;
        if !state.batch.is_empty()
            && state.last_enqueue.elapsed() >= pipeline.inner.config.memory_flush_idle
        {
            pipeline.flush_batch(&mut state).await;
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = codaph_memory::Result<T>>,
) -> codaph_memory::Result<T> {
    if limit.is_zero() {
        return call.await;
    }
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MemoryError::Timeout),
    }
}

fn validate_meta(meta: &IngestMeta) -> Result<()> {
    if meta.repo_id.trim().is_empty() {
        return Err(IngestError::InvalidInput("repoId is required".to_string()));
    }
    if meta.session_id.trim().is_empty() {
        return Err(IngestError::InvalidInput(
            "sessionId is required".to_string(),
        ));
    }
    if let Some(thread_id) = &meta.thread_id {
        if thread_id.trim().is_empty() {
            return Err(IngestError::InvalidInput(
                "threadId must be non-empty when provided".to_string(),
            ));
        }
    }
    if let EventSource::Other(tag) = &meta.source {
        if tag.trim().is_empty() {
            return Err(IngestError::InvalidInput(
                "source tag must be non-empty".to_string(),
            ));
        }
    }
    Ok(())
}

fn derive_reasoning_availability(event_type: &str, payload: &Value) -> ReasoningAvailability {
    if event_type != event_types::ITEM_COMPLETED {
        return ReasoningAvailability::Unavailable;
    }
    let Some(item) = payload.get("item") else {
        return ReasoningAvailability::Unavailable;
    };
    match serde_json::from_value::<ItemPayload>(item.clone()) {
        Ok(ItemPayload::Reasoning { text, summarized }) if !text.trim().is_empty() => {
            if summarized == Some(true) {
                ReasoningAvailability::Partial
            } else {
                ReasoningAvailability::Full
            }
        }
        _ => ReasoningAvailability::Unavailable,
    }
}

/// Lock a std mutex, continuing through poisoning.
pub(crate) fn lock_std<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn reasoning_availability_tracks_item_shape() {
        let full = json!({"item": {"type": "reasoning", "text": "chain of thought"}});
        let partial =
            json!({"item": {"type": "reasoning", "text": "summary", "summarized": true}});
        let empty = json!({"item": {"type": "reasoning", "text": ""}});
        let message = json!({"item": {"type": "agent_message", "text": "hi"}});

        assert_eq!(
            derive_reasoning_availability(event_types::ITEM_COMPLETED, &full),
            ReasoningAvailability::Full
        );
        assert_eq!(
            derive_reasoning_availability(event_types::ITEM_COMPLETED, &partial),
            ReasoningAvailability::Partial
        );
        assert_eq!(
            derive_reasoning_availability(event_types::ITEM_COMPLETED, &empty),
            ReasoningAvailability::Unavailable
        );
        assert_eq!(
            derive_reasoning_availability(event_types::ITEM_COMPLETED, &message),
            ReasoningAvailability::Unavailable
        );
        assert_eq!(
            derive_reasoning_availability(event_types::PROMPT_SUBMITTED, &full),
            ReasoningAvailability::Unavailable
        );
    }

    #[test]
    fn meta_validation_rejects_missing_fields() {
        let valid = IngestMeta::new(EventSource::CodexSdk, "r", "s", 1);
        assert!(validate_meta(&valid).is_ok());

        let mut missing_repo = valid.clone();
        missing_repo.repo_id = "  ".to_string();
        assert!(matches!(
            validate_meta(&missing_repo),
            Err(IngestError::InvalidInput(_))
        ));

        let mut empty_thread = valid.clone();
        empty_thread.thread_id = Some(String::new());
        assert!(matches!(
            validate_meta(&empty_thread),
            Err(IngestError::InvalidInput(_))
        ));
    }
}
