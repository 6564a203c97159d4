//! Pipeline configuration.
//!
//! One explicit value passed to the pipeline constructor; there is no
//! ambient configuration state and nothing here reads the environment.

use std::time::Duration;

use codaph_memory::DEFAULT_RUN_ID_PREFIX;
use codaph_memory::RunScope;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Stable project identity, used in memory run ids.
    pub project_id: String,
    /// Identity this capture process reports to the memory engine.
    pub agent_id: String,
    /// Whether memory runs are scoped per project or per session.
    pub run_scope: RunScope,
    /// Namespace prefix for run ids.
    pub run_id_prefix: String,
    /// Buffer this many envelopes before a batch write; 1 disables batching.
    pub memory_batch_size: usize,
    /// Deadline for each memory engine call. Zero disables the deadline.
    pub memory_write_timeout: Duration,
    /// Extra attempts for a transiently failing memory write. Zero means a
    /// single attempt per event.
    pub memory_write_max_retries: u32,
    /// Consecutive transient failures that open the circuit.
    pub memory_max_consecutive_errors: u32,
    /// How long the circuit stays open before one probe is allowed.
    pub memory_circuit_cooldown: Duration,
    /// Flush a partially filled batch after this much idle time.
    pub memory_flush_idle: Duration,
    /// When the mirror deduplicates locally, still forward the event to the
    /// memory engine. Off by default: the common case is a history re-run.
    pub retry_memory_write_on_local_dedup: bool,
}

impl PipelineConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            agent_id: "codaph".to_string(),
            run_scope: RunScope::Session,
            run_id_prefix: DEFAULT_RUN_ID_PREFIX.to_string(),
            memory_batch_size: 1,
            memory_write_timeout: Duration::from_secs(10),
            memory_write_max_retries: 0,
            memory_max_consecutive_errors: 5,
            memory_circuit_cooldown: Duration::from_secs(60),
            memory_flush_idle: Duration::from_secs(2),
            retry_memory_write_on_local_dedup: false,
        }
    }
}
