//! Sparse secondary indices: which segments hold a session's (or thread's)
//! events, plus aggregate stats. The writer keeps these in memory and
//! persists them alongside the manifest; readers load a snapshot at call
//! start.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use codaph_protocol::EventEnvelope;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseIndex {
    pub sessions: BTreeMap<String, SparseSessionIndex>,
    pub threads: BTreeMap<String, SparseThreadIndex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparseSessionIndex {
    #[serde(with = "codaph_protocol::ts_serde")]
    pub from: DateTime<Utc>,
    #[serde(with = "codaph_protocol::ts_serde")]
    pub to: DateTime<Utc>,
    pub event_count: u64,
    /// Highest sequence observed for the session; seeds the pipeline's
    /// ordering check across restarts.
    pub last_sequence: u64,
    /// Deduplicated, in first-touch order.
    pub segments: Vec<String>,
    pub contributors: BTreeSet<String>,
    pub threads: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparseThreadIndex {
    #[serde(with = "codaph_protocol::ts_serde")]
    pub from: DateTime<Utc>,
    #[serde(with = "codaph_protocol::ts_serde")]
    pub to: DateTime<Utc>,
    pub event_count: u64,
    pub segments: Vec<String>,
}

impl SparseIndex {
    /// Fold one appended envelope into the session and thread entries.
    pub(crate) fn note_event(&mut self, env: &EventEnvelope, segment: &str) {
        let session = self
            .sessions
            .entry(env.session_id.clone())
            .or_insert_with(|| SparseSessionIndex {
                from: env.ts,
                to: env.ts,
                event_count: 0,
                last_sequence: 0,
                segments: Vec::new(),
                contributors: BTreeSet::new(),
                threads: BTreeSet::new(),
            });
        if env.ts < session.from {
            session.from = env.ts;
        }
        if env.ts > session.to {
            session.to = env.ts;
        }
        session.event_count += 1;
        session.last_sequence = session.last_sequence.max(env.sequence);
        if !session.segments.iter().any(|s| s == segment) {
            session.segments.push(segment.to_string());
        }
        if let Some(actor) = &env.actor_id {
            session.contributors.insert(actor.clone());
        }
        session.threads.insert(env.thread().to_string());

        let thread = self
            .threads
            .entry(env.thread().to_string())
            .or_insert_with(|| SparseThreadIndex {
                from: env.ts,
                to: env.ts,
                event_count: 0,
                segments: Vec::new(),
            });
        if env.ts < thread.from {
            thread.from = env.ts;
        }
        if env.ts > thread.to {
            thread.to = env.ts;
        }
        thread.event_count += 1;
        if !thread.segments.iter().any(|s| s == segment) {
            thread.segments.push(segment.to_string());
        }
    }
}
