//! Projects file-change activity out of an event stream.
//!
//! Three event shapes carry file-change information: explicit `file_change`
//! items, `apply_patch` tool calls whose arguments embed a patch body, and
//! tool results that echo `git status`-style `M `/`A `/`D ` prefixes. The
//! projector folds all of them into per-path summaries and an ordered stream
//! of unified-diff fragments.
//!
//! Projection is a pure fold: two runs over the same event set produce
//! identical output, and the union of kinds per path is order-independent.

mod patch;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use codaph_protocol::EventEnvelope;
use codaph_protocol::FileChange;
use codaph_protocol::FileChangeKind;
use codaph_protocol::ItemPayload;
use codaph_protocol::event_types;
pub use patch::PatchHunk;
pub use patch::PatchParseError;
pub use patch::UpdateChunk;
pub use patch::extract_patch_body;
pub use patch::parse_patch;
pub use patch::parse_tool_call_patch;

/// Tool name whose calls carry patch bodies.
pub const APPLY_PATCH_TOOL: &str = "apply_patch";

/// Aggregate view of everything that happened to one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiffSummary {
    pub path: String,
    pub kinds: BTreeSet<FileChangeKind>,
    pub occurrences: u64,
}

/// One reconstructed diff body, labelled with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffFragment {
    pub ts: DateTime<Utc>,
    pub thread_id: String,
    pub path: String,
    pub kind: FileChangeKind,
    pub unified: String,
}

#[derive(Debug, Default)]
pub struct DiffProjector {
    summaries: BTreeMap<String, FileDiffSummary>,
    fragments: Vec<DiffFragment>,
}

impl DiffProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one envelope into the projection. Envelopes that carry no
    /// file-change information are ignored.
    pub fn observe(&mut self, env: &EventEnvelope) {
        if env.event_type != event_types::ITEM_COMPLETED {
            return;
        }
        match env.item() {
            Some(ItemPayload::FileChange { changes }) => {
                self.record_changes(&changes);
            }
            Some(ItemPayload::ToolCall {
                name, arguments, ..
            }) if name == APPLY_PATCH_TOOL => {
                let Some(Ok(hunks)) = parse_tool_call_patch(&arguments) else {
                    return;
                };
                self.record_changes(&changes_from_patch(&hunks));
                for hunk in &hunks {
                    self.fragments.push(DiffFragment {
                        ts: env.ts,
                        thread_id: env.thread().to_string(),
                        path: hunk.path().to_string(),
                        kind: hunk_kind(hunk),
                        unified: render_unified(hunk),
                    });
                }
            }
            Some(ItemPayload::ToolResult { output, .. }) => {
                self.record_changes(&changes_from_status_output(&output));
            }
            _ => {}
        }
    }

    pub fn observe_all<'a>(&mut self, events: impl IntoIterator<Item = &'a EventEnvelope>) {
        for env in events {
            self.observe(env);
        }
    }

    fn record_changes(&mut self, changes: &[FileChange]) {
        // (kind, path) pairs are deduplicated within one event.
        let unique: BTreeSet<&FileChange> = changes.iter().collect();
        for change in unique {
            let entry = self
                .summaries
                .entry(change.path.clone())
                .or_insert_with(|| FileDiffSummary {
                    path: change.path.clone(),
                    kinds: BTreeSet::new(),
                    occurrences: 0,
                });
            entry.kinds.insert(change.kind);
            entry.occurrences += 1;
        }
    }

    /// Summaries for all paths, or only those under `path_filter` when given.
    /// Sorted by path.
    pub fn summaries(&self, path_filter: Option<&str>) -> Vec<FileDiffSummary> {
        self.summaries
            .values()
            .filter(|summary| path_filter.is_none_or(|prefix| summary.path.starts_with(prefix)))
            .cloned()
            .collect()
    }

    /// Diff fragments in observation order.
    pub fn fragments(&self) -> &[DiffFragment] {
        &self.fragments
    }
}

fn hunk_kind(hunk: &PatchHunk) -> FileChangeKind {
    match hunk {
        PatchHunk::AddFile { .. } => FileChangeKind::Add,
        PatchHunk::DeleteFile { .. } => FileChangeKind::Delete,
        PatchHunk::UpdateFile { .. } => FileChangeKind::Update,
    }
}

/// Flatten parsed patch hunks into file-change entries.
pub fn changes_from_patch(hunks: &[PatchHunk]) -> Vec<FileChange> {
    hunks
        .iter()
        .map(|hunk| FileChange {
            path: hunk.path().to_string(),
            kind: hunk_kind(hunk),
        })
        .collect()
}

/// Recover file changes from status-letter prefixed tool output
/// (`M path`, `A path`, `D path`).
pub fn changes_from_status_output(output: &str) -> Vec<FileChange> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (kind, rest) = if let Some(rest) = line.strip_prefix("M ") {
                (FileChangeKind::Update, rest)
            } else if let Some(rest) = line.strip_prefix("A ") {
                (FileChangeKind::Add, rest)
            } else if let Some(rest) = line.strip_prefix("D ") {
                (FileChangeKind::Delete, rest)
            } else {
                return None;
            };
            let path = rest.trim();
            if path.is_empty() {
                return None;
            }
            Some(FileChange {
                path: path.to_string(),
                kind,
            })
        })
        .collect()
}

fn render_unified(hunk: &PatchHunk) -> String {
    let mut out = String::new();
    match hunk {
        PatchHunk::AddFile { path, lines } => {
            out.push_str(&format!("--- /dev/null\n+++ b/{path}\n@@\n"));
            for line in lines {
                out.push('+');
                out.push_str(line);
                out.push('\n');
            }
        }
        PatchHunk::DeleteFile { path } => {
            out.push_str(&format!("--- a/{path}\n+++ /dev/null\n"));
        }
        PatchHunk::UpdateFile { path, chunks, .. } => {
            out.push_str(&format!("--- a/{path}\n+++ b/{path}\n"));
            for chunk in chunks {
                match &chunk.change_context {
                    Some(context) => out.push_str(&format!("@@ {context}\n")),
                    None => out.push_str("@@\n"),
                }
                for line in &chunk.lines {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
    }
    out
}
