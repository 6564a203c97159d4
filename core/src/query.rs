//! Read-only query surface over a repo's mirror.
//!
//! Queries load the last published manifest and sparse-index snapshot at
//! call start, so they are linearisable with respect to the writer's fsynced
//! generations and never see in-flight appends. Missing segments are treated
//! as empty subsets.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::DateTime;
use chrono::Utc;
use codaph_diff::DiffFragment;
use codaph_diff::DiffProjector;
use codaph_diff::FileDiffSummary;
use codaph_mirror::MirrorStore;
use codaph_protocol::EventEnvelope;

use crate::error::Result;
use crate::pipeline::lock_std;

/// Timeline selection. Absent fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct TimelineFilter {
    pub repo_id: String,
    pub session_id: Option<String>,
    pub thread_id: Option<String>,
    pub actor_id: Option<String>,
    pub item_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimelineFilter {
    pub fn for_repo(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub event_count: u64,
    pub contributors: BTreeSet<String>,
    pub threads: BTreeSet<String>,
}

pub struct QueryService {
    mirror: Arc<StdMutex<MirrorStore>>,
}

impl QueryService {
    pub fn new(mirror: Arc<StdMutex<MirrorStore>>) -> Self {
        Self { mirror }
    }

    /// All sessions known for a repo, most recently active first.
    pub fn list_sessions(&self, repo_id: &str) -> Result<Vec<SessionSummary>> {
        let sparse = lock_std(&self.mirror).read_sparse_index(repo_id)?;
        let mut sessions: Vec<SessionSummary> = sparse
            .sessions
            .into_iter()
            .map(|(session_id, idx)| SessionSummary {
                session_id,
                from: idx.from,
                to: idx.to,
                event_count: idx.event_count,
                contributors: idx.contributors,
                threads: idx.threads,
            })
            .collect();
        sessions.sort_by(|a, b| b.to.cmp(&a.to));
        Ok(sessions)
    }

    /// Filtered event timeline, ordered by `ts` ascending with a stable
    /// tie-break on `sequence`.
    pub fn get_timeline(&self, filter: &TimelineFilter) -> Result<Vec<EventEnvelope>> {
        let reader = {
            let mirror = lock_std(&self.mirror);
            let manifest = mirror.read_manifest(&filter.repo_id)?;
            let sparse = mirror.read_sparse_index(&filter.repo_id)?;

            // Minimal segment set: the union of the session's and thread's
            // segments when either is constrained, the whole manifest
            // otherwise.
            let mut segments: Vec<String> = Vec::new();
            if filter.session_id.is_none() && filter.thread_id.is_none() {
                segments = manifest.segments.keys().cloned().collect();
            } else {
                if let Some(session_id) = &filter.session_id {
                    if let Some(idx) = sparse.sessions.get(session_id) {
                        extend_unique(&mut segments, &idx.segments);
                    }
                }
                if let Some(thread_id) = &filter.thread_id {
                    if let Some(idx) = sparse.threads.get(thread_id) {
                        extend_unique(&mut segments, &idx.segments);
                    }
                }
            }
            mirror.read_events_from_segments(segments)
        };

        let mut events: Vec<EventEnvelope> =
            reader.filter(|env| matches_filter(env, filter)).collect();
        events.sort_by(|a, b| a.ts.cmp(&b.ts).then(a.sequence.cmp(&b.sequence)));
        Ok(events)
    }

    /// Per-path file-change summaries for a session, optionally restricted
    /// to a path prefix.
    pub fn get_diff_summary(
        &self,
        repo_id: &str,
        session_id: &str,
        path_filter: Option<&str>,
    ) -> Result<Vec<FileDiffSummary>> {
        Ok(self.project_session(repo_id, session_id)?.summaries(path_filter))
    }

    /// Ordered diff fragments for a session.
    pub fn get_diff_fragments(
        &self,
        repo_id: &str,
        session_id: &str,
    ) -> Result<Vec<DiffFragment>> {
        Ok(self
            .project_session(repo_id, session_id)?
            .fragments()
            .to_vec())
    }

    pub fn list_contributors(&self, repo_id: &str, session_id: &str) -> Result<Vec<String>> {
        let sparse = lock_std(&self.mirror).read_sparse_index(repo_id)?;
        Ok(sparse
            .sessions
            .get(session_id)
            .map(|idx| idx.contributors.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn project_session(&self, repo_id: &str, session_id: &str) -> Result<DiffProjector> {
        let mut filter = TimelineFilter::for_repo(repo_id);
        filter.session_id = Some(session_id.to_string());
        let events = self.get_timeline(&filter)?;
        let mut projector = DiffProjector::new();
        projector.observe_all(&events);
        Ok(projector)
    }
}

fn extend_unique(segments: &mut Vec<String>, more: &[String]) {
    for segment in more {
        if !segments.iter().any(|s| s == segment) {
            segments.push(segment.clone());
        }
    }
}

fn matches_filter(env: &EventEnvelope, filter: &TimelineFilter) -> bool {
    if let Some(session_id) = &filter.session_id {
        if &env.session_id != session_id {
            return false;
        }
    }
    if let Some(thread_id) = &filter.thread_id {
        if env.thread() != thread_id {
            return false;
        }
    }
    if let Some(actor_id) = &filter.actor_id {
        if env.actor_id.as_deref() != Some(actor_id.as_str()) {
            return false;
        }
    }
    if let Some(item_type) = &filter.item_type {
        let found = env
            .payload
            .get("item")
            .and_then(|item| item.get("type"))
            .and_then(|t| t.as_str());
        if found != Some(item_type.as_str()) {
            return false;
        }
    }
    if let Some(from) = &filter.from {
        if env.ts < *from {
            return false;
        }
    }
    if let Some(to) = &filter.to {
        if env.ts > *to {
            return false;
        }
    }
    true
}
