//! Segment file I/O: scanning with torn-tail recovery, and streaming reads
//! across a list of segments.

use std::collections::VecDeque;
use std::fs;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Lines;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use codaph_protocol::EventEnvelope;
use codaph_protocol::parse_line;
use tracing::warn;

use crate::MirrorError;
use crate::Result;

pub(crate) fn line_crc(line: &str) -> u32 {
    crc32fast::hash(line.as_bytes())
}

/// Everything learned from replaying one segment file.
pub(crate) struct SegmentScan {
    pub valid_bytes: u64,
    pub events: Vec<EventEnvelope>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// CRC32 chain state over the per-line checksums, positioned after the
    /// last valid line.
    pub chain: crc32fast::Hasher,
}

impl SegmentScan {
    pub(crate) fn checksum_hex(&self) -> String {
        format!("{:08x}", self.chain.clone().finalize())
    }
}

/// Replay a segment, keeping the longest prefix of complete,
/// newline-terminated, parseable envelope lines. With `truncate` set, any
/// torn tail beyond that prefix is cut off before the segment accepts new
/// writes.
pub(crate) fn scan_segment(path: &Path, truncate: bool) -> Result<SegmentScan> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(MirrorError::io(path, e)),
    };

    let mut scan = SegmentScan {
        valid_bytes: 0,
        events: Vec::new(),
        from: None,
        to: None,
        chain: crc32fast::Hasher::new(),
    };

    let mut pos = 0usize;
    while let Some(nl) = bytes[pos..].iter().position(|&b| b == b'\n') {
        let line_bytes = &bytes[pos..pos + nl];
        let Ok(line) = std::str::from_utf8(line_bytes) else {
            break;
        };
        let Ok(env) = parse_line(line) else {
            break;
        };
        scan.chain.update(&line_crc(line).to_le_bytes());
        scan.from = Some(scan.from.map_or(env.ts, |from: DateTime<Utc>| from.min(env.ts)));
        scan.to = Some(scan.to.map_or(env.ts, |to: DateTime<Utc>| to.max(env.ts)));
        scan.events.push(env);
        pos += nl + 1;
    }
    scan.valid_bytes = pos as u64;

    if truncate && (pos as u64) < bytes.len() as u64 {
        warn!(
            path = %path.display(),
            dropped = bytes.len() - pos,
            "truncating torn segment tail"
        );
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| MirrorError::io(path, e))?;
        file.set_len(pos as u64).map_err(|e| MirrorError::io(path, e))?;
        file.sync_all().map_err(|e| MirrorError::io(path, e))?;
    }

    Ok(scan)
}

/// Streaming reader over an ordered list of segment files. Missing segments
/// and unparseable lines are skipped with a warning; they are never fatal
/// for a read.
pub struct SegmentEvents {
    root: PathBuf,
    pending: VecDeque<String>,
    current: Option<Lines<BufReader<File>>>,
}

impl SegmentEvents {
    pub(crate) fn new(root: PathBuf, segments: Vec<String>) -> Self {
        Self {
            root,
            pending: segments.into(),
            current: None,
        }
    }
}

impl Iterator for SegmentEvents {
    type Item = EventEnvelope;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(lines) = &mut self.current {
                match lines.next() {
                    Some(Ok(line)) => match parse_line(&line) {
                        Ok(env) => return Some(env),
                        Err(e) => {
                            warn!(error = %e, "skipping unparseable segment line");
                        }
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "read failure mid-segment; moving on");
                        self.current = None;
                    }
                    None => self.current = None,
                }
                continue;
            }

            let rel = self.pending.pop_front()?;
            let path = self.root.join(&rel);
            match File::open(&path) {
                Ok(file) => self.current = Some(BufReader::new(file).lines()),
                Err(e) => {
                    warn!(segment = %rel, error = %e, "segment missing; eliding from read");
                }
            }
        }
    }
}
