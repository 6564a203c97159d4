//! The manifest is the authoritative list of a repo's segments. It is
//! persisted after every commit group and always through a temp file plus
//! atomic rename, so readers either see the previous generation or the new
//! one, never a torn write.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::MirrorError;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    /// Bumped once per fsynced commit group. A reader opening after a
    /// publish sees every event up to that generation.
    pub generation: u64,
    /// Root-relative segment path → stats.
    pub segments: BTreeMap<String, SegmentStat>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentStat {
    #[serde(with = "codaph_protocol::ts_serde")]
    pub from: DateTime<Utc>,
    #[serde(with = "codaph_protocol::ts_serde")]
    pub to: DateTime<Utc>,
    pub event_count: u64,
    /// CRC32 chain over the segment's per-line checksums, 8 hex chars.
    pub checksum: String,
}

impl SegmentStat {
    pub(crate) fn first(ts: DateTime<Utc>) -> Self {
        Self {
            from: ts,
            to: ts,
            event_count: 0,
            checksum: String::new(),
        }
    }

    pub(crate) fn note(&mut self, ts: DateTime<Utc>) {
        if ts < self.from {
            self.from = ts;
        }
        if ts > self.to {
            self.to = ts;
        }
        self.event_count += 1;
    }
}

/// Load a JSON state file, treating a missing file as the default value.
pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map_err(MirrorError::Serialize),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(MirrorError::io(path, e)),
    }
}

/// Persist a JSON state file atomically: write to a temp file in the target
/// directory, fsync it, then rename over the destination.
pub(crate) fn persist_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        MirrorError::io(
            path,
            std::io::Error::other("state file path has no parent directory"),
        )
    })?;
    fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| MirrorError::io(parent, e))?;
    let contents = serde_json::to_string_pretty(value).map_err(MirrorError::Serialize)?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| MirrorError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| MirrorError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| MirrorError::io(path, e.error))?;
    Ok(())
}
