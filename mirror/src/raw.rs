//! Raw transcript mirror: verbatim (but already redacted) upstream lines,
//! one JSONL file per session, used for forensic replay.
//!
//! The full line including its trailing newline is written with a single
//! `write(2)` call on a descriptor opened with `O_APPEND`, which keeps
//! concurrent appends from interleaving.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::MirrorError;
use crate::Result;
use crate::layout;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub(crate) fn append_raw_line(root: &Path, session_id: &str, line: &str) -> Result<()> {
    let path = layout::raw_path(root, session_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
    }

    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(&path).map_err(|e| MirrorError::io(&path, e))?;
    ensure_owner_only_permissions(&file, &path)?;

    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(&line.replace(['\n', '\r'], " "));
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .map_err(|e| MirrorError::io(&path, e))?;
    file.flush().map_err(|e| MirrorError::io(&path, e))?;
    Ok(())
}

#[cfg(unix)]
fn ensure_owner_only_permissions(file: &std::fs::File, path: &Path) -> Result<()> {
    let metadata = file.metadata().map_err(|e| MirrorError::io(path, e))?;
    let current_mode = metadata.permissions().mode() & 0o777;
    if current_mode != 0o600 {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms)
            .map_err(|e| MirrorError::io(path, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_owner_only_permissions(_file: &std::fs::File, _path: &Path) -> Result<()> {
    Ok(())
}
