#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use codaph_core::Pipeline;
use codaph_core::PipelineConfig;
use codaph_memory::ContextSnapshot;
use codaph_memory::MemoryEngine;
use codaph_memory::MemoryError;
use codaph_memory::MemoryEventRecord;
use codaph_memory::MemoryWriteReceipt;
use codaph_memory::SemanticContext;
use codaph_memory::SemanticQuery;
use codaph_memory::SnapshotRequest;
use codaph_mirror::MirrorConfig;
use codaph_mirror::MirrorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBehavior {
    Succeed,
    /// Fails with a timeout: transient.
    Transient,
    /// Fails with a schema error: permanent.
    Permanent,
}

/// In-memory engine double that records every call.
pub struct RecordingMemory {
    pub behavior: Mutex<MemoryBehavior>,
    pub batch_supported: bool,
    pub writes: Mutex<Vec<MemoryEventRecord>>,
    pub batches: Mutex<Vec<Vec<MemoryEventRecord>>>,
    pub snapshot: Mutex<ContextSnapshot>,
}

impl RecordingMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(MemoryBehavior::Succeed),
            batch_supported: true,
            writes: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            snapshot: Mutex::new(ContextSnapshot::default()),
        })
    }

    pub fn set_behavior(&self, behavior: MemoryBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    fn fail_if_configured(&self) -> Result<(), MemoryError> {
        match *self.behavior.lock().unwrap() {
            MemoryBehavior::Succeed => Ok(()),
            MemoryBehavior::Transient => Err(MemoryError::Timeout),
            MemoryBehavior::Permanent => Err(MemoryError::Schema(
                serde_json::from_str::<serde_json::Value>("not json").unwrap_err(),
            )),
        }
    }
}

#[async_trait]
impl MemoryEngine for RecordingMemory {
    fn is_enabled(&self) -> bool {
        true
    }

    fn supports_batch(&self) -> bool {
        self.batch_supported
    }

    async fn write_event(
        &self,
        record: &MemoryEventRecord,
    ) -> Result<MemoryWriteReceipt, MemoryError> {
        self.writes.lock().unwrap().push(record.clone());
        self.fail_if_configured()?;
        Ok(MemoryWriteReceipt {
            accepted: true,
            job_id: None,
            deduplicated: None,
        })
    }

    async fn write_events_batch(
        &self,
        records: &[MemoryEventRecord],
    ) -> Result<Vec<MemoryWriteReceipt>, MemoryError> {
        self.batches.lock().unwrap().push(records.to_vec());
        self.fail_if_configured()?;
        Ok(records
            .iter()
            .map(|_| MemoryWriteReceipt {
                accepted: true,
                job_id: None,
                deduplicated: None,
            })
            .collect())
    }

    async fn query_semantic_context(
        &self,
        _query: &SemanticQuery,
    ) -> Result<SemanticContext, MemoryError> {
        self.fail_if_configured()?;
        Ok(SemanticContext::default())
    }

    async fn fetch_context_snapshot(
        &self,
        _request: &SnapshotRequest,
    ) -> Result<ContextSnapshot, MemoryError> {
        self.fail_if_configured()?;
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::new("proj-1");
    config.agent_id = "agent-under-test".to_string();
    config
}

pub fn make_pipeline(
    root: &Path,
    config: PipelineConfig,
    memory: Option<Arc<dyn MemoryEngine>>,
) -> Pipeline {
    let mirror = MirrorStore::open(MirrorConfig::new(root)).unwrap();
    Pipeline::new(config, mirror, memory)
}
