//! Pulls a run's timeline out of the memory engine and backfills the local
//! mirror with entries it does not have yet. Re-running is harmless: the
//! mirror's event-id dedup absorbs repetition.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use codaph_memory::MemoryEngine;
use codaph_memory::SnapshotRequest;
use codaph_mirror::MirrorStore;
use codaph_protocol::EventEnvelope;
use codaph_protocol::EventSource;
use codaph_protocol::ReasoningAvailability;
use codaph_protocol::format_ts;
use codaph_protocol::parse_ts;
use codaph_protocol::stable_hash_id;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::pipeline::lock_std;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSyncReport {
    pub imported: u64,
    pub deduplicated: u64,
    pub skipped: u64,
}

pub type RemoteProgressCallback = Box<dyn Fn(&RemoteSyncReport) + Send + Sync>;

const PROGRESS_EVERY_ENTRIES: u64 = 25;

pub struct RemoteMemorySync {
    memory: Arc<dyn MemoryEngine>,
    mirror: Arc<StdMutex<MirrorStore>>,
    progress: Option<RemoteProgressCallback>,
}

impl RemoteMemorySync {
    pub fn new(memory: Arc<dyn MemoryEngine>, mirror: Arc<StdMutex<MirrorStore>>) -> Self {
        Self {
            memory,
            mirror,
            progress: None,
        }
    }

    pub fn with_progress(
        mut self,
        progress: impl Fn(&RemoteSyncReport) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Fetch the run's timeline and append every parseable entry to the
    /// mirror. Entries that already exist count as deduplicated; entries
    /// that cannot be interpreted as events are skipped.
    pub async fn run(
        &self,
        repo_id: &str,
        run_id: &str,
        session_id: &str,
        timeline_limit: Option<u32>,
    ) -> Result<RemoteSyncReport> {
        let snapshot = self
            .memory
            .fetch_context_snapshot(&SnapshotRequest {
                run_id: run_id.to_string(),
                timeline_limit,
                refresh: true,
            })
            .await?;

        let mut report = RemoteSyncReport::default();
        for (index, entry) in snapshot.timeline.iter().enumerate() {
            let Some(env) = envelope_from_entry(entry, repo_id, session_id, index) else {
                report.skipped += 1;
                continue;
            };
            let outcome = {
                let mirror = self.mirror.clone();
                tokio::task::spawn_blocking(move || lock_std(&mirror).append_event(&env)).await??
            };
            if outcome.deduplicated {
                report.deduplicated += 1;
            } else {
                report.imported += 1;
            }
            if (index as u64 + 1) % PROGRESS_EVERY_ENTRIES == 0 {
                if let Some(progress) = &self.progress {
                    progress(&report);
                }
            }
        }

        {
            let mirror = self.mirror.clone();
            tokio::task::spawn_blocking(move || lock_std(&mirror).flush()).await??;
        }
        if let Some(progress) = &self.progress {
            progress(&report);
        }
        debug!(
            imported = report.imported,
            deduplicated = report.deduplicated,
            skipped = report.skipped,
            "remote memory sync finished"
        );
        Ok(report)
    }
}

/// Interpret one opaque timeline record as an envelope. Field names follow
/// the engine's wire contract, with camelCase fallbacks.
fn envelope_from_entry(
    entry: &Value,
    repo_id: &str,
    default_session: &str,
    index: usize,
) -> Option<EventEnvelope> {
    let event_type = str_field(entry, &["event_type", "eventType"])?;
    let payload = match entry.get("payload") {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
        Some(_) => {
            warn!(index, "timeline entry payload is not an object; skipping");
            return None;
        }
    };
    let session_id =
        str_field(entry, &["session_id", "sessionId"]).unwrap_or_else(|| default_session.to_string());
    let ts_raw = str_field(entry, &["ts", "timestamp"]);
    let ts = ts_raw
        .as_deref()
        .and_then(parse_ts)
        .unwrap_or_else(Utc::now);
    let sequence = entry
        .get("sequence")
        .and_then(Value::as_u64)
        .unwrap_or(index as u64 + 1);

    let event_id = str_field(entry, &["event_id", "eventId", "idempotency_key"])
        .unwrap_or_else(|| {
            let entry_id = str_field(entry, &["id", "entry_id"]).unwrap_or_default();
            stable_hash_id(&[&entry_id, &format_ts(&ts), &event_type, &session_id])
        });

    let source = str_field(entry, &["source"])
        .map(|tag| EventSource::from(tag.as_str()))
        .unwrap_or(EventSource::Other("memory".to_string()));

    Some(EventEnvelope {
        event_id,
        source,
        repo_id: repo_id.to_string(),
        actor_id: str_field(entry, &["actor_id", "actorId"]),
        session_id,
        thread_id: str_field(entry, &["thread_id", "threadId"]),
        ts,
        sequence,
        event_type,
        payload,
        reasoning_availability: str_field(entry, &["reasoningAvailability", "reasoning_availability"])
            .and_then(|raw| serde_json::from_value(Value::String(raw)).ok())
            .unwrap_or(ReasoningAvailability::Unavailable),
    })
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn entries_without_ids_get_a_stable_fallback() {
        let entry = json!({
            "id": "t-1",
            "event_type": "prompt.submitted",
            "ts": "2025-06-01T12:00:00.000Z",
            "payload": {"text": "hi"},
        });
        let a = envelope_from_entry(&entry, "repo", "s1", 0).unwrap();
        let b = envelope_from_entry(&entry, "repo", "s1", 0).unwrap();
        assert_eq!(a.event_id, b.event_id);
        assert_eq!(a.event_id.len(), 48);
        assert_eq!(a.session_id, "s1");
        assert_eq!(a.sequence, 1);
    }

    #[test]
    fn unusable_entries_are_rejected() {
        assert!(envelope_from_entry(&json!({"payload": {}}), "repo", "s1", 0).is_none());
        assert!(
            envelope_from_entry(
                &json!({"event_type": "x", "payload": "not an object"}),
                "repo",
                "s1",
                0
            )
            .is_none()
        );
    }
}
