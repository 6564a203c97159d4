//! On-disk layout of a mirror root.
//!
//! ```text
//! <root>/
//!   segments/<repoId>/<YYYY>/<MM>/<DD>/<NNNN>.jsonl
//!   index/<repoId>/manifest.json
//!   index/<repoId>/sparse.json
//!   index/<repoId>/<source>.json      (history-sync cursors)
//!   index/<repoId>/manifest.lock
//!   raw/<sessionId>.jsonl
//! ```

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;

pub(crate) const SEGMENTS_DIR: &str = "segments";
pub(crate) const INDEX_DIR: &str = "index";
pub(crate) const RAW_DIR: &str = "raw";
pub(crate) const MANIFEST_FILE: &str = "manifest.json";
pub(crate) const SPARSE_FILE: &str = "sparse.json";
pub(crate) const LOCK_FILE: &str = "manifest.lock";

/// Reduce an opaque id to a single safe path component.
pub(crate) fn fs_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub(crate) fn repo_segments_dir(root: &Path, repo_id: &str) -> PathBuf {
    root.join(SEGMENTS_DIR).join(fs_safe(repo_id))
}

pub(crate) fn repo_index_dir(root: &Path, repo_id: &str) -> PathBuf {
    root.join(INDEX_DIR).join(fs_safe(repo_id))
}

pub(crate) fn manifest_path(root: &Path, repo_id: &str) -> PathBuf {
    repo_index_dir(root, repo_id).join(MANIFEST_FILE)
}

pub(crate) fn sparse_path(root: &Path, repo_id: &str) -> PathBuf {
    repo_index_dir(root, repo_id).join(SPARSE_FILE)
}

pub(crate) fn lock_path(root: &Path, repo_id: &str) -> PathBuf {
    repo_index_dir(root, repo_id).join(LOCK_FILE)
}

pub(crate) fn raw_path(root: &Path, session_id: &str) -> PathBuf {
    root.join(RAW_DIR).join(format!("{}.jsonl", fs_safe(session_id)))
}

/// Calendar-day bucket a timestamp falls into, as a relative dir fragment.
pub(crate) fn bucket_of(ts: &DateTime<Utc>) -> String {
    ts.format("%Y/%m/%d").to_string()
}

/// Root-relative path of a segment file, as recorded in the manifest.
pub(crate) fn segment_rel_path(repo_id: &str, bucket: &str, rotation: u32) -> String {
    format!("{SEGMENTS_DIR}/{}/{bucket}/{rotation:04}.jsonl", fs_safe(repo_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_safe_replaces_separators() {
        assert_eq!(fs_safe("github.com/acme/widget"), "github.com-acme-widget");
        assert_eq!(fs_safe("plain-id_1.2"), "plain-id_1.2");
    }

    #[test]
    fn segment_paths_embed_bucket_and_rotation() {
        assert_eq!(
            segment_rel_path("repo", "2025/06/01", 3),
            "segments/repo/2025/06/01/0003.jsonl"
        );
    }
}
