#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use codaph_core::IngestError;
use codaph_core::IngestMeta;
use codaph_core::QueryService;
use codaph_core::TimelineFilter;
use codaph_protocol::EventSource;
use codaph_protocol::canonical_line;
use common::MemoryBehavior;
use common::RecordingMemory;
use common::make_pipeline;
use common::test_config;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn meta(sequence: u64) -> IngestMeta {
    let mut meta = IngestMeta::new(EventSource::CodexSdk, "repo-1", "s1", sequence);
    meta.ts = Some(format!("2025-06-01T12:00:{:02}.000Z", sequence.min(59)));
    meta.actor_id = Some("alice".to_string());
    meta
}

#[tokio::test]
async fn ingested_envelopes_come_back_byte_identical_from_the_timeline() {
    let dir = TempDir::new().unwrap();
    let pipeline = make_pipeline(dir.path(), test_config(), None);

    let payload = json!({
        "item": {"type": "agent_message", "text": "key sk-123456789012345678901234567890 used"}
    });
    let env = pipeline
        .ingest("item.completed", payload, meta(1))
        .await
        .unwrap();
    assert!(!env.payload.to_string().contains("sk-1234567890"));
    pipeline.flush().await.unwrap();

    let query = QueryService::new(pipeline.mirror());
    let mut filter = TimelineFilter::for_repo("repo-1");
    filter.session_id = Some("s1".to_string());
    let timeline = query.get_timeline(&filter).unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0], env);
    assert_eq!(
        canonical_line(&timeline[0]).unwrap(),
        canonical_line(&env).unwrap()
    );
}

#[tokio::test]
async fn reingesting_the_same_event_dedups_and_writes_memory_once() {
    let dir = TempDir::new().unwrap();
    let memory = RecordingMemory::new();
    let pipeline = make_pipeline(dir.path(), test_config(), Some(memory.clone()));

    let payload = json!({"item": {"type": "agent_message", "text": "hello"}});
    let first = pipeline
        .ingest("item.completed", payload.clone(), meta(1))
        .await
        .unwrap();
    let second = pipeline
        .ingest("item.completed", payload, meta(1))
        .await
        .unwrap();
    assert_eq!(first.event_id, second.event_id);
    pipeline.flush().await.unwrap();

    assert_eq!(memory.write_count(), 1, "memory must be written exactly once");

    let query = QueryService::new(pipeline.mirror());
    let timeline = query
        .get_timeline(&TimelineFilter::for_repo("repo-1"))
        .unwrap();
    assert_eq!(timeline.len(), 1, "mirror must not grow on re-ingest");
}

#[tokio::test]
async fn local_dedup_can_be_configured_to_still_write_memory() {
    let dir = TempDir::new().unwrap();
    let memory = RecordingMemory::new();
    let mut config = test_config();
    config.retry_memory_write_on_local_dedup = true;
    let pipeline = make_pipeline(dir.path(), config, Some(memory.clone()));

    let payload = json!({"item": {"type": "agent_message", "text": "hello"}});
    pipeline
        .ingest("item.completed", payload.clone(), meta(1))
        .await
        .unwrap();
    pipeline
        .ingest("item.completed", payload, meta(1))
        .await
        .unwrap();
    assert_eq!(memory.write_count(), 2);
}

#[tokio::test]
async fn stale_sequences_for_new_events_are_rejected() {
    let dir = TempDir::new().unwrap();
    let pipeline = make_pipeline(dir.path(), test_config(), None);

    pipeline
        .ingest("prompt.submitted", json!({"item": {"type": "user_message", "text": "a"}}), meta(2))
        .await
        .unwrap();

    let err = pipeline
        .ingest("prompt.submitted", json!({"item": {"type": "user_message", "text": "b"}}), meta(2))
        .await
        .unwrap_err();
    match err {
        IngestError::OutOfOrderSequence { got, last, .. } => {
            assert_eq!(got, 2);
            assert_eq!(last, 2);
        }
        other => panic!("expected OutOfOrderSequence, got {other:?}"),
    }
}

#[tokio::test]
async fn sequence_enforcement_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    {
        let pipeline = make_pipeline(dir.path(), test_config(), None);
        pipeline
            .ingest("prompt.submitted", json!({"text": "a"}), meta(5))
            .await
            .unwrap();
        pipeline.flush().await.unwrap();
    }

    // A fresh process seeds its sequence map from the sparse index.
    let pipeline = make_pipeline(dir.path(), test_config(), None);
    let err = pipeline
        .ingest("prompt.submitted", json!({"text": "b"}), meta(3))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::OutOfOrderSequence { .. }));

    pipeline
        .ingest("prompt.submitted", json!({"text": "c"}), meta(6))
        .await
        .unwrap();
}

#[tokio::test]
async fn batch_mode_issues_one_batch_call_and_no_singles() {
    let dir = TempDir::new().unwrap();
    let memory = RecordingMemory::new();
    let mut config = test_config();
    config.memory_batch_size = 2;
    let pipeline = make_pipeline(dir.path(), config, Some(memory.clone()));

    pipeline
        .ingest("prompt.submitted", json!({"text": "one"}), meta(1))
        .await
        .unwrap();
    pipeline
        .ingest("prompt.submitted", json!({"text": "two"}), meta(2))
        .await
        .unwrap();
    pipeline.flush().await.unwrap();

    assert_eq!(memory.write_count(), 0, "no single writes in batch mode");
    assert_eq!(memory.batch_count(), 1, "exactly one batch call");
    assert_eq!(memory.batches.lock().unwrap()[0].len(), 2);
}

#[tokio::test]
async fn circuit_opens_after_consecutive_transient_failures() {
    let dir = TempDir::new().unwrap();
    let memory = RecordingMemory::new();
    memory.set_behavior(MemoryBehavior::Transient);
    let mut config = test_config();
    config.memory_max_consecutive_errors = 2;
    let errors_seen = Arc::new(AtomicUsize::new(0));
    let pipeline = make_pipeline(dir.path(), config, Some(memory.clone()));
    {
        let errors_seen = errors_seen.clone();
        pipeline.set_memory_error_handler(move |_| {
            errors_seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    for sequence in 1..=3 {
        pipeline
            .ingest("prompt.submitted", json!({"text": "x"}), meta(sequence))
            .await
            .unwrap();
    }
    pipeline.flush().await.unwrap();

    assert_eq!(
        memory.write_count(),
        2,
        "third write must be skipped by the open circuit"
    );
    assert_eq!(errors_seen.load(Ordering::SeqCst), 2);
    assert!(pipeline.memory_circuit_open().await);

    let query = QueryService::new(pipeline.mirror());
    let timeline = query
        .get_timeline(&TimelineFilter::for_repo("repo-1"))
        .unwrap();
    assert_eq!(timeline.len(), 3, "mirror writes continue while the circuit is open");
}

#[tokio::test]
async fn permanent_memory_failures_open_the_circuit_immediately() {
    let dir = TempDir::new().unwrap();
    let memory = RecordingMemory::new();
    memory.set_behavior(MemoryBehavior::Permanent);
    let mut config = test_config();
    config.memory_max_consecutive_errors = 10;
    let pipeline = make_pipeline(dir.path(), config, Some(memory.clone()));

    pipeline
        .ingest("prompt.submitted", json!({"text": "x"}), meta(1))
        .await
        .unwrap();
    assert!(pipeline.memory_circuit_open().await);

    pipeline
        .ingest("prompt.submitted", json!({"text": "y"}), meta(2))
        .await
        .unwrap();
    assert_eq!(memory.write_count(), 1);
}

#[tokio::test]
async fn raw_lines_are_redacted_but_safe_fields_survive() {
    let dir = TempDir::new().unwrap();
    let pipeline = make_pipeline(dir.path(), test_config(), None);

    pipeline
        .ingest_raw_line(
            "s1",
            r#"{"type":"user","apiKey":"sk-123456789012345678901234567890","tokenEstimate":"24k"}"#,
        )
        .await
        .unwrap();

    let contents = std::fs::read_to_string(dir.path().join("raw/s1.jsonl")).unwrap();
    assert!(contents.contains("[REDACTED]"));
    assert!(!contents.contains("sk-1234567890"));
    assert!(contents.contains(r#""tokenEstimate":"24k""#));
    assert_eq!(contents.lines().count(), 1);
}

#[tokio::test]
async fn missing_meta_fields_are_invalid_input() {
    let dir = TempDir::new().unwrap();
    let pipeline = make_pipeline(dir.path(), test_config(), None);

    let mut bad_meta = meta(1);
    bad_meta.repo_id = String::new();
    let err = pipeline
        .ingest("prompt.submitted", json!({}), bad_meta)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidInput(_)));
}
