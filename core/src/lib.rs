//! Root of the `codaph-core` library.
//!
//! The hub of the system: the ingest pipeline that canonicalises, redacts,
//! mirrors and publishes agent-session events, plus the read-only query
//! surface, the history-sync projector for external transcripts, and the
//! remote memory timeline importer.

// Library code never prints; everything user-visible goes through tracing.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod circuit;
pub mod config;
pub mod error;
pub mod history_sync;
pub mod pipeline;
pub mod query;
pub mod remote_sync;
pub(crate) mod util;

pub use config::PipelineConfig;
pub use error::IngestError;
pub use error::Result;
pub use history_sync::HistorySync;
pub use history_sync::HistorySyncConfig;
pub use history_sync::SyncProgress;
pub use history_sync::SyncReport;
pub use pipeline::IngestMeta;
pub use pipeline::Pipeline;
pub use query::QueryService;
pub use query::SessionSummary;
pub use query::TimelineFilter;
pub use remote_sync::RemoteMemorySync;
pub use remote_sync::RemoteSyncReport;
