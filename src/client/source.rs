//! Snapshot sources for the client cache

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::RollupError;
use crate::snapshot::SnapshotAssembler;
use crate::types::ComprehensiveSnapshot;

/// Where the cache fetches snapshots from
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, patient_id: &str, days: u32) -> Result<ComprehensiveSnapshot, RollupError>;
}

/// Source backed by an in-process [`SnapshotAssembler`]
#[derive(Clone)]
pub struct LocalSource {
    assembler: Arc<SnapshotAssembler>,
}

impl LocalSource {
    pub fn new(assembler: Arc<SnapshotAssembler>) -> Self {
        Self { assembler }
    }
}

#[async_trait]
impl SnapshotSource for LocalSource {
    async fn fetch(&self, patient_id: &str, days: u32) -> Result<ComprehensiveSnapshot, RollupError> {
        let assembler = Arc::clone(&self.assembler);
        let patient_id = patient_id.to_string();
        // SQLite reads and aggregation block; keep them off the async workers
        tokio::task::spawn_blocking(move || assembler.get_comprehensive_snapshot(&patient_id, days))
            .await
            .map_err(|e| RollupError::Task(e.to_string()))?
    }
}
