//! Imports external agent transcripts into the pipeline.
//!
//! Transcript files are newline-delimited JSON in the upstream rollout
//! format: a `session_meta` record first, then `turn_context`, `event_msg`
//! and `response_item` records. Each file gets a persistent cursor
//! `(lineCount, sequence, sessionId, cwd)` so re-runs resume where they left
//! off; projection is idempotent because event ids are content-derived and
//! the mirror deduplicates.
//!
//! A file is ignored when its recorded `cwd` falls outside the project root,
//! and blocked until a `session_meta` record shows up. A single bad line is
//! skipped, never fatal for the batch; only local-store failures abort.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use codaph_diff::changes_from_patch;
use codaph_diff::changes_from_status_output;
use codaph_diff::parse_tool_call_patch;
use codaph_protocol::EventSource;
use codaph_protocol::ItemPayload;
use codaph_protocol::event_types;
use codaph_protocol::format_ts;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tempfile::NamedTempFile;
use tracing::debug;
use tracing::warn;

use crate::error::IngestError;
use crate::error::Result;
use crate::pipeline::IngestMeta;
use crate::pipeline::Pipeline;

const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(120);
const PROGRESS_EVERY_EVENTS: u64 = 50;

#[derive(Debug, Clone)]
pub struct HistorySyncConfig {
    pub repo_id: String,
    /// Source tag stamped on every projected envelope.
    pub source: EventSource,
    /// Name of the cursor state file under the repo's index dir.
    pub source_name: String,
    /// Files whose `cwd` is outside this root are ignored.
    pub project_root: PathBuf,
    /// Directory of `*.jsonl` transcripts to scan.
    pub transcripts_dir: PathBuf,
    pub actor_id: Option<String>,
}

impl HistorySyncConfig {
    pub fn new(
        repo_id: impl Into<String>,
        project_root: impl Into<PathBuf>,
        transcripts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo_id: repo_id.into(),
            source: EventSource::CodexSdk,
            source_name: "codex-history".to_string(),
            project_root: project_root.into(),
            transcripts_dir: transcripts_dir.into(),
            actor_id: None,
        }
    }
}

/// Per-file progress state, persisted as `{ files: { absolutePath → cursor } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub files: BTreeMap<String, FileCursor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCursor {
    pub line_count: u64,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files_scanned: u64,
    pub files_ignored: u64,
    pub files_blocked: u64,
    pub imported_events: u64,
    pub skipped_lines: u64,
    pub cursor_resets: u64,
}

#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub file: String,
    pub imported_events: u64,
}

pub type ProgressCallback = Box<dyn Fn(&SyncProgress) + Send + Sync>;

pub struct HistorySync {
    pipeline: Pipeline,
    config: HistorySyncConfig,
    progress: Option<ProgressCallback>,
}

struct ProgressThrottle {
    last_report: Instant,
    events_since_report: u64,
}

impl HistorySync {
    pub fn new(pipeline: Pipeline, config: HistorySyncConfig) -> Self {
        Self {
            pipeline,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(&SyncProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Scan the transcripts directory once, importing every new line, and
    /// persist cursors after each file.
    pub async fn run(&self) -> Result<SyncReport> {
        let state_path = self
            .pipeline
            .history_state_path(&self.config.repo_id, &self.config.source_name);
        let mut state = load_state(&state_path);
        let mut report = SyncReport::default();
        let mut throttle = ProgressThrottle {
            last_report: Instant::now(),
            events_since_report: 0,
        };

        let mut files = list_transcript_files(&self.config.transcripts_dir).await?;
        files.sort();
        for path in files {
            report.files_scanned += 1;
            self.process_file(&path, &mut state, &mut report, &mut throttle)
                .await?;
            persist_state(&state_path, &state)?;
        }
        // Publish what was imported before handing control back.
        self.pipeline.flush().await?;
        Ok(report)
    }

    async fn process_file(
        &self,
        path: &Path,
        state: &mut CursorState,
        report: &mut SyncReport,
        throttle: &mut ProgressThrottle,
    ) -> Result<()> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| IngestError::HistoryIo {
                path: path.to_path_buf(),
                source: e,
            })?;
        let lines: Vec<&str> = contents.lines().collect();
        let path_key = path.to_string_lossy().to_string();
        let mut cursor = state.files.get(&path_key).cloned().unwrap_or_default();

        // Recovery for cursors advanced by an older, buggy importer: a
        // cursor that counted lines without ever assigning sequences is
        // rewound so those lines are imported properly.
        if cursor.sequence == 0 && cursor.line_count > 0 {
            warn!(file = %path_key, "cursor recovery rewind: lineCount reset to 0");
            cursor.line_count = 0;
            report.cursor_resets += 1;
        }
        // Truncation: the file was rotated underneath the cursor.
        if (lines.len() as u64) < cursor.line_count {
            warn!(
                file = %path_key,
                cursor_lines = cursor.line_count,
                file_lines = lines.len(),
                "transcript shrank; resetting cursor"
            );
            cursor = FileCursor::default();
            report.cursor_resets += 1;
        }

        let (session_id, cwd) = match &cursor.session_id {
            Some(session_id) => (session_id.clone(), cursor.cwd.clone()),
            None => match identify_session(&lines) {
                Some(found) => found,
                None => {
                    debug!(file = %path_key, "no session_meta yet; file stays blocked");
                    report.files_blocked += 1;
                    return Ok(());
                }
            },
        };
        if let Some(cwd) = &cwd {
            if !Path::new(cwd).starts_with(&self.config.project_root) {
                debug!(file = %path_key, cwd = %cwd, "cwd outside project root; ignoring file");
                report.files_ignored += 1;
                return Ok(());
            }
        }
        cursor.session_id = Some(session_id.clone());
        cursor.cwd = cwd;

        for (idx, line) in lines.iter().enumerate().skip(cursor.line_count as usize) {
            let parsed: Option<Value> = serde_json::from_str(line).ok();
            let Some(value) = parsed else {
                warn!(file = %path_key, line = idx + 1, "unparseable history line; skipped");
                report.skipped_lines += 1;
                cursor.line_count = (idx + 1) as u64;
                continue;
            };

            let emissions = project_record(&value);
            if !emissions.is_empty() {
                self.pipeline.ingest_raw_line(&session_id, line).await?;
                let ts = record_ts(&value);
                for (event_type, payload) in emissions {
                    let sequence = cursor.sequence + 1;
                    let meta = IngestMeta {
                        source: self.config.source.clone(),
                        repo_id: self.config.repo_id.clone(),
                        session_id: session_id.clone(),
                        thread_id: Some(session_id.clone()),
                        actor_id: self.config.actor_id.clone(),
                        ts: ts.clone(),
                        sequence,
                        event_id: None,
                    };
                    match self.pipeline.ingest(&event_type, payload, meta).await {
                        Ok(_) => {
                            cursor.sequence = sequence;
                            report.imported_events += 1;
                            self.maybe_report_progress(&path_key, report, throttle);
                        }
                        Err(e @ (IngestError::MirrorWrite(_) | IngestError::TaskJoin(_))) => {
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(file = %path_key, line = idx + 1, error = %e, "record not imported");
                            report.skipped_lines += 1;
                        }
                    }
                }
            }
            cursor.line_count = (idx + 1) as u64;
        }

        cursor.updated_at = format_ts(&Utc::now());
        state.files.insert(path_key, cursor);
        Ok(())
    }

    fn maybe_report_progress(
        &self,
        file: &str,
        report: &SyncReport,
        throttle: &mut ProgressThrottle,
    ) {
        let Some(progress) = &self.progress else {
            return;
        };
        throttle.events_since_report += 1;
        if throttle.events_since_report >= PROGRESS_EVERY_EVENTS
            || throttle.last_report.elapsed() >= PROGRESS_MIN_INTERVAL
        {
            progress(&SyncProgress {
                file: file.to_string(),
                imported_events: report.imported_events,
            });
            throttle.last_report = Instant::now();
            throttle.events_since_report = 0;
        }
    }
}

async fn list_transcript_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => {
            return Err(IngestError::HistoryIo {
                path: dir.to_path_buf(),
                source: e,
            });
        }
    };
    while let Some(entry) = entries.next_entry().await.map_err(|e| IngestError::HistoryIo {
        path: dir.to_path_buf(),
        source: e,
    })? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            out.push(path);
        }
    }
    Ok(out)
}

fn load_state(path: &Path) -> CursorState {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "unreadable cursor state; starting fresh");
            CursorState::default()
        }),
        Err(_) => CursorState::default(),
    }
}

/// Copy-on-write cursor persistence: write to a temp file in the same
/// directory, fsync, then rename over the state file.
fn persist_state(path: &Path, state: &CursorState) -> Result<()> {
    let io_err = |source| IngestError::HistoryIo {
        path: path.to_path_buf(),
        source,
    };
    let parent = path
        .parent()
        .ok_or_else(|| io_err(std::io::Error::other("state path has no parent")))?;
    std::fs::create_dir_all(parent).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    let contents = serde_json::to_string_pretty(state)
        .map_err(|e| io_err(std::io::Error::other(e)))?;
    tmp.write_all(contents.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Find the session identity for a file: the first `session_meta` record.
fn identify_session(lines: &[&str]) -> Option<(String, Option<String>)> {
    for line in lines {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("type").and_then(Value::as_str) != Some("session_meta") {
            continue;
        }
        let payload = value.get("payload").unwrap_or(&value);
        let Some(id) = first_str(payload, &["id", "session_id", "thread_id"]) else {
            continue;
        };
        let cwd = first_str(payload, &["cwd"]);
        return Some((id, cwd));
    }
    None
}

fn record_ts(value: &Value) -> Option<String> {
    first_str(value, &["timestamp", "ts"])
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Project one raw transcript record into zero or more `(eventType, payload)`
/// emissions.
fn project_record(value: &Value) -> Vec<(String, Value)> {
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Vec::new();
    };
    let payload = value.get("payload").unwrap_or(value);
    match kind {
        "session_meta" => vec![(
            event_types::THREAD_STARTED.to_string(),
            json!({
                "thread_id": first_str(payload, &["id", "session_id", "thread_id"]),
                "cwd": payload.get("cwd").cloned().unwrap_or(Value::Null),
                "source": payload.get("source").cloned().unwrap_or(Value::Null),
                "originator": payload.get("originator").cloned().unwrap_or(Value::Null),
            }),
        )],
        "turn_context" => vec![(
            event_types::TURN_STARTED.to_string(),
            json!({
                "turnId": first_str(payload, &["turn_id", "turnId"]),
                "cwd": payload.get("cwd").cloned().unwrap_or(Value::Null),
                "model": payload.get("model").cloned().unwrap_or(Value::Null),
            }),
        )],
        "event_msg" => project_event_msg(payload),
        "response_item" => project_response_item(payload),
        _ => Vec::new(),
    }
}

fn project_event_msg(payload: &Value) -> Vec<(String, Value)> {
    let Some(kind) = payload.get("type").and_then(Value::as_str) else {
        return Vec::new();
    };
    match kind {
        "user_message" => first_str(payload, &["message", "text"])
            .map(|text| {
                (
                    event_types::PROMPT_SUBMITTED.to_string(),
                    ItemPayload::UserMessage { text }.into_payload(),
                )
            })
            .into_iter()
            .collect(),
        "agent_reasoning" => first_str(payload, &["text", "message"])
            .map(|text| {
                (
                    event_types::ITEM_COMPLETED.to_string(),
                    ItemPayload::Reasoning {
                        text,
                        summarized: Some(true),
                    }
                    .into_payload(),
                )
            })
            .into_iter()
            .collect(),
        "agent_message" => first_str(payload, &["message", "text"])
            .map(|text| {
                (
                    event_types::ITEM_COMPLETED.to_string(),
                    ItemPayload::AgentMessage { text }.into_payload(),
                )
            })
            .into_iter()
            .collect(),
        "task_complete" => vec![(
            event_types::TURN_COMPLETED.to_string(),
            json!({
                "last_agent_message": payload
                    .get("last_agent_message")
                    .cloned()
                    .unwrap_or(Value::Null),
            }),
        )],
        _ => Vec::new(),
    }
}

fn project_response_item(payload: &Value) -> Vec<(String, Value)> {
    let Some(kind) = payload.get("type").and_then(Value::as_str) else {
        return Vec::new();
    };
    match kind {
        "reasoning" => {
            // Raw chain-of-thought content when present, otherwise the
            // model's summary.
            let raw = join_texts(payload.get("content"));
            let (text, summarized) = if raw.is_empty() {
                (join_texts(payload.get("summary")), Some(true))
            } else {
                (raw, None)
            };
            if text.is_empty() {
                return Vec::new();
            }
            vec![(
                event_types::ITEM_COMPLETED.to_string(),
                ItemPayload::Reasoning { text, summarized }.into_payload(),
            )]
        }
        "function_call" => {
            let Some(name) = first_str(payload, &["name"]) else {
                return Vec::new();
            };
            let arguments = first_str(payload, &["arguments"]).unwrap_or_default();
            let call_id = first_str(payload, &["call_id", "id"]);
            let mut out = vec![(
                event_types::ITEM_COMPLETED.to_string(),
                ItemPayload::ToolCall {
                    name,
                    arguments: arguments.clone(),
                    call_id,
                }
                .into_payload(),
            )];
            if let Some(Ok(hunks)) = parse_tool_call_patch(&arguments) {
                let changes = changes_from_patch(&hunks);
                if !changes.is_empty() {
                    out.push((
                        event_types::ITEM_COMPLETED.to_string(),
                        ItemPayload::FileChange { changes }.into_payload(),
                    ));
                }
            }
            out
        }
        "function_call_output" => {
            let output = match payload.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => first_str(other, &["content", "output"]).unwrap_or_default(),
                None => String::new(),
            };
            let call_id = first_str(payload, &["call_id", "id"]);
            let mut out = vec![(
                event_types::ITEM_COMPLETED.to_string(),
                ItemPayload::ToolResult {
                    output: output.clone(),
                    call_id,
                    exit_code: None,
                }
                .into_payload(),
            )];
            let changes = changes_from_status_output(&output);
            if !changes.is_empty() {
                out.push((
                    event_types::ITEM_COMPLETED.to_string(),
                    ItemPayload::FileChange { changes }.into_payload(),
                ));
            }
            out
        }
        "message" => {
            if first_str(payload, &["role"]).as_deref() != Some("assistant") {
                return Vec::new();
            }
            // Intermediate assistant messages carry a non-final phase tag.
            if let Some(phase) = first_str(payload, &["phase"]) {
                if phase != "final_answer" {
                    return Vec::new();
                }
            }
            let text = join_texts(payload.get("content"));
            if text.is_empty() {
                return Vec::new();
            }
            vec![(
                event_types::ITEM_COMPLETED.to_string(),
                ItemPayload::AgentMessage { text }.into_payload(),
            )]
        }
        _ => Vec::new(),
    }
}

/// Collect the `text` fields of a content/summary array.
fn join_texts(value: Option<&Value>) -> String {
    let Some(Value::Array(items)) = value else {
        return String::new();
    };
    items
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn session_meta_projects_thread_started() {
        let record = json!({
            "type": "session_meta",
            "payload": {"id": "s-9", "cwd": "/work/repo", "originator": "cli"}
        });
        let emissions = project_record(&record);
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].0, "thread.started");
        assert_eq!(emissions[0].1["thread_id"], "s-9");
        assert_eq!(emissions[0].1["cwd"], "/work/repo");
    }

    #[test]
    fn function_call_with_patch_synthesises_a_file_change() {
        let record = json!({
            "type": "response_item",
            "payload": {
                "type": "function_call",
                "name": "apply_patch",
                "call_id": "c1",
                "arguments": "{\"input\":\"*** Begin Patch\\n*** Add File: a.ts\\n+x\\n*** Update File: b.ts\\n-y\\n+z\\n*** End Patch\"}"
            }
        });
        let emissions = project_record(&record);
        assert_eq!(emissions.len(), 2);
        assert_eq!(emissions[0].1["item"]["type"], "tool_call");
        assert_eq!(emissions[1].1["item"]["type"], "file_change");
        let changes = emissions[1].1["item"]["changes"].as_array().unwrap();
        let mut pairs: Vec<(String, String)> = changes
            .iter()
            .map(|c| {
                (
                    c["path"].as_str().unwrap().to_string(),
                    c["kind"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("a.ts".to_string(), "add".to_string()),
                ("b.ts".to_string(), "update".to_string()),
            ]
        );
    }

    #[test]
    fn tool_output_status_lines_synthesise_file_changes() {
        let record = json!({
            "type": "response_item",
            "payload": {
                "type": "function_call_output",
                "call_id": "c1",
                "output": "M src/lib.rs\nD old.rs"
            }
        });
        let emissions = project_record(&record);
        assert_eq!(emissions.len(), 2);
        assert_eq!(emissions[1].1["item"]["type"], "file_change");
    }

    #[test]
    fn non_final_assistant_messages_are_not_projected() {
        let draft = json!({
            "type": "response_item",
            "payload": {
                "type": "message",
                "role": "assistant",
                "phase": "draft",
                "content": [{"type": "output_text", "text": "thinking…"}]
            }
        });
        assert!(project_record(&draft).is_empty());

        let final_answer = json!({
            "type": "response_item",
            "payload": {
                "type": "message",
                "role": "assistant",
                "phase": "final_answer",
                "content": [{"type": "output_text", "text": "done"}]
            }
        });
        let emissions = project_record(&final_answer);
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].1["item"]["text"], "done");
    }

    #[test]
    fn unknown_record_types_emit_nothing() {
        assert!(project_record(&json!({"type": "compacted", "payload": {}})).is_empty());
        assert!(project_record(&json!({"no_type": true})).is_empty());
    }
}
