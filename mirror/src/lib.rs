//! Crash-safe, append-only local mirror of agent-session events.
//!
//! Events live in newline-delimited canonical JSON *segments*, partitioned
//! by repository and calendar day and rotated by size. A per-repo *manifest*
//! lists the segments with their stats; *sparse indices* map sessions and
//! threads to the segments that contain their events. Appends are
//! deduplicated by event id, serialised through a single writer per repo
//! (in-process state plus an OS advisory lock), and made durable in commit
//! groups: fsync of the active segment followed by an atomic manifest and
//! sparse-index publish.
//!
//! Recovery model: segments are the source of truth. On writer open the
//! repo's segments are replayed: torn tails are truncated to the last valid
//! line, and manifest/sparse state is rebuilt to match the surviving bytes,
//! which also absorbs segments orphaned by a crash between segment write and
//! manifest publish.

mod layout;
mod lock;
mod manifest;
mod raw;
mod segment;
mod sparse;

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use codaph_protocol::EventEnvelope;
use codaph_protocol::canonical_line;
pub use manifest::Manifest;
pub use manifest::SegmentStat;
pub use segment::SegmentEvents;
pub use sparse::SparseIndex;
pub use sparse::SparseSessionIndex;
pub use sparse::SparseThreadIndex;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

pub(crate) use manifest::load_json;
pub(crate) use manifest::persist_json;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode mirror state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("could not acquire exclusive mirror lock at {path}")]
    LockBusy { path: PathBuf },
}

impl MirrorError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        MirrorError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Mirror root, conventionally `<project>/<dot-dir>`.
    pub root: PathBuf,
    /// Rotate the active segment once it reaches this many bytes.
    pub rotate_bytes: u64,
    /// Commit group size: fsync + publish after this many appends…
    pub group_commit_events: u32,
    /// …or after this much time since the last commit, whichever first.
    pub group_commit_interval: Duration,
}

impl MirrorConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rotate_bytes: 8 * 1024 * 1024,
            group_commit_events: 32,
            group_commit_interval: Duration::from_millis(250),
        }
    }
}

/// Result of one append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// True when the event id was already present and nothing was written.
    pub deduplicated: bool,
    /// Root-relative segment path the line went to; `None` on dedup.
    pub segment: Option<String>,
    /// Byte offset of the line within its segment.
    pub offset: u64,
    /// CRC32 of the appended line.
    pub checksum: u32,
}

struct ActiveSegment {
    rel_path: String,
    bucket: String,
    file: File,
    bytes: u64,
    chain: crc32fast::Hasher,
}

impl ActiveSegment {
    fn checksum_hex(&self) -> String {
        format!("{:08x}", self.chain.clone().finalize())
    }
}

struct RepoState {
    repo_id: String,
    /// Held for the lifetime of the opened repo.
    _lock: File,
    manifest: Manifest,
    sparse: SparseIndex,
    /// sessionId → event ids already present; kept warm by appends.
    event_ids: HashMap<String, HashSet<String>>,
    active: Option<ActiveSegment>,
    pending_events: u32,
    last_commit: Instant,
    dirty: bool,
}

/// Single-writer, multi-reader event mirror rooted at one directory.
pub struct MirrorStore {
    config: MirrorConfig,
    repos: HashMap<String, RepoState>,
}

impl MirrorStore {
    pub fn open(config: MirrorConfig) -> Result<Self> {
        fs::create_dir_all(&config.root).map_err(|e| MirrorError::io(&config.root, e))?;
        Ok(Self {
            config,
            repos: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Where a history-sync source keeps its cursor state for a repo.
    pub fn history_state_path(&self, repo_id: &str, source: &str) -> PathBuf {
        layout::repo_index_dir(&self.config.root, repo_id)
            .join(format!("{}.json", layout::fs_safe(source)))
    }

    /// Append one envelope. Atomic per event: either the line is written and
    /// the in-memory indices updated, or nothing is observable. Events whose
    /// id is already present are not written again.
    pub fn append_event(&mut self, env: &EventEnvelope) -> Result<AppendOutcome> {
        let derived;
        let env = if env.event_id.is_empty() {
            let mut filled = env.clone();
            filled.event_id = filled.derived_event_id();
            derived = filled;
            &derived
        } else {
            env
        };

        let config = &self.config;
        let repo = open_repo(config, &mut self.repos, &env.repo_id)?;

        if repo
            .event_ids
            .get(&env.session_id)
            .is_some_and(|ids| ids.contains(&env.event_id))
        {
            debug!(event_id = %env.event_id, "append deduplicated");
            return Ok(AppendOutcome {
                deduplicated: true,
                segment: None,
                offset: 0,
                checksum: 0,
            });
        }

        let line = canonical_line(env)?;
        let crc = segment::line_crc(&line);
        let bucket = layout::bucket_of(&env.ts);
        repo.ensure_active_segment(config, &bucket)?;

        // The repo holds an active segment from here on; failures below leave
        // only unindexed bytes behind, which the next open replays or trims.
        let Some(active) = repo.active.as_mut() else {
            return Err(MirrorError::io(
                &config.root,
                std::io::Error::other("active segment unavailable after rotation"),
            ));
        };
        let offset = active.bytes;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(&line);
        buf.push('\n');
        let segment_path = config.root.join(&active.rel_path);
        active
            .file
            .write_all(buf.as_bytes())
            .map_err(|e| MirrorError::io(&segment_path, e))?;
        active.bytes += buf.len() as u64;
        active.chain.update(&crc.to_le_bytes());

        let rel = active.rel_path.clone();
        let chain_hex = active.checksum_hex();
        let stat = repo
            .manifest
            .segments
            .entry(rel.clone())
            .or_insert_with(|| SegmentStat::first(env.ts));
        stat.note(env.ts);
        stat.checksum = chain_hex;

        repo.sparse.note_event(env, &rel);
        repo.event_ids
            .entry(env.session_id.clone())
            .or_default()
            .insert(env.event_id.clone());
        repo.pending_events += 1;
        repo.dirty = true;
        repo.maybe_commit(config)?;

        Ok(AppendOutcome {
            deduplicated: false,
            segment: Some(rel),
            offset,
            checksum: crc,
        })
    }

    /// Append one redacted upstream line to the session's raw mirror.
    pub fn append_raw_line(&mut self, session_id: &str, line: &str) -> Result<()> {
        raw::append_raw_line(&self.config.root, session_id, line)
    }

    /// Force a commit group: fsync active segments and publish manifest and
    /// sparse index for every opened repo.
    pub fn flush(&mut self) -> Result<()> {
        for repo in self.repos.values_mut() {
            if repo.dirty || repo.pending_events > 0 {
                repo.commit(&self.config)?;
            }
        }
        Ok(())
    }

    /// Whether an event id is already recorded for a session.
    pub fn contains_event(
        &mut self,
        repo_id: &str,
        session_id: &str,
        event_id: &str,
    ) -> Result<bool> {
        let repo = open_repo(&self.config, &mut self.repos, repo_id)?;
        Ok(repo
            .event_ids
            .get(session_id)
            .is_some_and(|ids| ids.contains(event_id)))
    }

    /// Highest sequence recorded for a session, from the writer's view.
    pub fn last_sequence(&mut self, repo_id: &str, session_id: &str) -> Result<u64> {
        let repo = open_repo(&self.config, &mut self.repos, repo_id)?;
        Ok(repo
            .sparse
            .sessions
            .get(session_id)
            .map_or(0, |s| s.last_sequence))
    }

    /// Reader surface: the last published manifest generation.
    pub fn read_manifest(&self, repo_id: &str) -> Result<Manifest> {
        load_json(&layout::manifest_path(&self.config.root, repo_id))
    }

    /// Reader surface: the last published sparse index.
    pub fn read_sparse_index(&self, repo_id: &str) -> Result<SparseIndex> {
        load_json(&layout::sparse_path(&self.config.root, repo_id))
    }

    /// Stream envelopes from the given root-relative segment paths, in
    /// segment order. Missing segments are elided with a warning.
    pub fn read_events_from_segments(&self, segments: Vec<String>) -> SegmentEvents {
        SegmentEvents::new(self.config.root.clone(), segments)
    }
}

impl Drop for MirrorStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "final mirror flush failed on drop");
        }
    }
}

fn open_repo<'a>(
    config: &MirrorConfig,
    repos: &'a mut HashMap<String, RepoState>,
    repo_id: &str,
) -> Result<&'a mut RepoState> {
    if !repos.contains_key(repo_id) {
        let state = RepoState::open(config, repo_id)?;
        repos.insert(repo_id.to_string(), state);
    }
    let Some(repo) = repos.get_mut(repo_id) else {
        // Just inserted above.
        return Err(MirrorError::io(
            &config.root,
            std::io::Error::other("repo state lookup failed"),
        ));
    };
    Ok(repo)
}

impl RepoState {
    /// Open a repo for writing: take the advisory lock, then rebuild the
    /// manifest and sparse index by replaying the segments found on disk.
    /// Torn tails are truncated on the way through.
    fn open(config: &MirrorConfig, repo_id: &str) -> Result<Self> {
        let lock = lock::acquire_exclusive(&layout::lock_path(&config.root, repo_id))?;

        let persisted_manifest: Manifest =
            load_json(&layout::manifest_path(&config.root, repo_id))?;
        let persisted_sparse: SparseIndex =
            load_json(&layout::sparse_path(&config.root, repo_id))?;

        let mut manifest = Manifest {
            generation: persisted_manifest.generation,
            segments: Default::default(),
        };
        let mut sparse = SparseIndex::default();
        let mut event_ids: HashMap<String, HashSet<String>> = HashMap::new();

        for rel in collect_segment_files(&config.root, repo_id)? {
            let path = config.root.join(&rel);
            let scan = segment::scan_segment(&path, true)?;
            let (Some(from), Some(to)) = (scan.from, scan.to) else {
                continue;
            };
            manifest.segments.insert(
                rel.clone(),
                SegmentStat {
                    from,
                    to,
                    event_count: scan.events.len() as u64,
                    checksum: scan.checksum_hex(),
                },
            );
            for env in &scan.events {
                sparse.note_event(env, &rel);
                event_ids
                    .entry(env.session_id.clone())
                    .or_default()
                    .insert(env.event_id.clone());
            }
        }

        let mut state = Self {
            repo_id: repo_id.to_string(),
            _lock: lock,
            manifest,
            sparse,
            event_ids,
            active: None,
            pending_events: 0,
            last_commit: Instant::now(),
            dirty: false,
        };

        if state.manifest.segments != persisted_manifest.segments
            || state.sparse != persisted_sparse
        {
            debug!(repo_id, "rebuilt mirror indices diverged from persisted state; republishing");
            state.commit(config)?;
        }
        Ok(state)
    }

    /// Make sure the active segment matches the event's bucket and is under
    /// the rotation threshold, opening or rotating as needed.
    fn ensure_active_segment(&mut self, config: &MirrorConfig, bucket: &str) -> Result<()> {
        if let Some(active) = &self.active {
            if active.bucket == bucket && active.bytes < config.rotate_bytes {
                return Ok(());
            }
        }
        if let Some(previous) = self.active.take() {
            let path = config.root.join(&previous.rel_path);
            previous
                .file
                .sync_data()
                .map_err(|e| MirrorError::io(&path, e))?;
        }

        let dir = layout::repo_segments_dir(&config.root, &self.repo_id).join(bucket);
        fs::create_dir_all(&dir).map_err(|e| MirrorError::io(&dir, e))?;

        // Append to the bucket's newest file while it is under the rotation
        // threshold; otherwise start the next rotation counter.
        let rotations = list_rotations(&dir)?;
        let rotation = match rotations.iter().max_by_key(|(r, _)| *r) {
            Some((newest, size)) if *size < config.rotate_bytes => *newest,
            Some((newest, _)) => newest + 1,
            None => 0,
        };
        let rel = layout::segment_rel_path(&self.repo_id, bucket, rotation);

        let path = config.root.join(&rel);
        // Replay the reopened file so the byte count and checksum chain pick
        // up where the last run stopped; a torn tail is trimmed here.
        let scan = segment::scan_segment(&path, true)?;
        let file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| MirrorError::io(&path, e))?;

        self.active = Some(ActiveSegment {
            rel_path: rel,
            bucket: bucket.to_string(),
            file,
            bytes: scan.valid_bytes,
            chain: scan.chain,
        });
        Ok(())
    }

    fn maybe_commit(&mut self, config: &MirrorConfig) -> Result<()> {
        if self.pending_events >= config.group_commit_events
            || self.last_commit.elapsed() >= config.group_commit_interval
        {
            self.commit(config)?;
        }
        Ok(())
    }

    /// One logical durability step: fsync the active segment, then publish
    /// manifest and sparse index atomically under a new generation.
    fn commit(&mut self, config: &MirrorConfig) -> Result<()> {
        if let Some(active) = &self.active {
            let path = config.root.join(&active.rel_path);
            active
                .file
                .sync_data()
                .map_err(|e| MirrorError::io(&path, e))?;
        }
        self.manifest.generation += 1;
        persist_json(
            &layout::manifest_path(&config.root, &self.repo_id),
            &self.manifest,
        )?;
        persist_json(
            &layout::sparse_path(&config.root, &self.repo_id),
            &self.sparse,
        )?;
        self.pending_events = 0;
        self.last_commit = Instant::now();
        self.dirty = false;
        Ok(())
    }
}

/// All segment files for a repo, as sorted root-relative paths.
fn collect_segment_files(root: &Path, repo_id: &str) -> Result<Vec<String>> {
    let base = layout::repo_segments_dir(root, repo_id);
    let mut found = Vec::new();
    collect_jsonl_files(&base, &mut found)?;
    found.sort();
    let mut rels = Vec::with_capacity(found.len());
    for path in found {
        if let Ok(rel) = path.strip_prefix(root) {
            rels.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(rels)
}

fn collect_jsonl_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(MirrorError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| MirrorError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_jsonl_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "jsonl") {
            out.push(path);
        }
    }
    Ok(())
}

/// Rotation counters and sizes of the `NNNN.jsonl` files in one bucket dir.
fn list_rotations(dir: &Path) -> Result<Vec<(u32, u64)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MirrorError::io(dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MirrorError::io(dir, e))?;
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(rotation) = stem.parse::<u32>() else {
            continue;
        };
        let size = entry
            .metadata()
            .map_err(|e| MirrorError::io(&path, e))?
            .len();
        out.push((rotation, size));
    }
    Ok(out)
}
