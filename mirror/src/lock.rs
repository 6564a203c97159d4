//! Cross-process writer exclusion via an advisory lock on the repo's
//! `manifest.lock`. The lock is held for the lifetime of the opened repo;
//! acquisition retries a bounded number of times so a contended writer fails
//! fast instead of waiting forever.

use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use crate::MirrorError;
use crate::Result;

const MAX_RETRIES: usize = 10;
const RETRY_SLEEP: Duration = Duration::from_millis(100);

pub(crate) fn acquire_exclusive(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| MirrorError::io(path, e))?;

    for _ in 0..MAX_RETRIES {
        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(MirrorError::io(path, e)),
        }
    }

    Err(MirrorError::LockBusy {
        path: path.to_path_buf(),
    })
}
