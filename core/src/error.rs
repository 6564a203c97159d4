use std::path::PathBuf;

use codaph_memory::MemoryError;
use codaph_mirror::MirrorError;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Failure taxonomy of the ingest surface.
///
/// Anything that compromises the local store surfaces to the caller; remote
/// memory failures are absorbed by the pipeline and only reach this type on
/// the explicitly remote operations (query, remote sync).
#[derive(Error, Debug)]
pub enum IngestError {
    /// Missing or malformed metadata, or an unusable record. Skippable for
    /// batch drivers, fatal for the single ingest call.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The caller-supplied sequence does not strictly increase.
    #[error(
        "out-of-order sequence for session {session_id}: got {got}, last observed {last}"
    )]
    OutOfOrderSequence {
        session_id: String,
        got: u64,
        last: u64,
    },

    /// The local mirror could not persist the event. Fatal for the ingest
    /// call; the store is left consistent.
    #[error("mirror write failed: {0}")]
    MirrorWrite(#[from] MirrorError),

    /// History sync could not read its inputs or persist its cursor.
    #[error("history sync I/O failure at {path}: {source}")]
    HistoryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A memory engine failure on an operation whose whole purpose is the
    /// engine (remote sync, semantic query). Pipeline ingest never returns
    /// this; it reports memory trouble through its error callback instead.
    #[error("memory engine failure: {0}")]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    TaskJoin(#[from] JoinError),
}
