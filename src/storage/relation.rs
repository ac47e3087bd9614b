use crate::storage::buffer::{BufferManager, MemoryBufferManager};
use crate::wal::{BrinWalRecord, WalSink};
use crate::error::Result;
use crate::storage::page::Lsn;
use std::sync::Arc;

/// An index relation: its name, its page store and, when durable, its WAL.
#[derive(Debug, Clone)]
pub struct IndexRelation {
    name: String,
    buffers: Arc<dyn BufferManager>,
    wal: Option<Arc<dyn WalSink>>,
}

impl IndexRelation {
    pub fn new(
        name: impl Into<String>,
        buffers: Arc<dyn BufferManager>,
        wal: Option<Arc<dyn WalSink>>,
    ) -> Self {
        Self {
            name: name.into(),
            buffers,
            wal,
        }
    }

    /// Unlogged relation over a fresh in-memory pool.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(MemoryBufferManager::new()), None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffers(&self) -> &dyn BufferManager {
        self.buffers.as_ref()
    }

    pub fn needs_wal(&self) -> bool {
        self.wal.is_some()
    }

    /// Append a redo record if the relation is logged. Returns the LSN to stamp on touched pages.
    pub fn log(&self, record: BrinWalRecord) -> Result<Option<Lsn>> {
        match &self.wal {
            Some(wal) => wal.log(record).map(Some),
            None => Ok(None),
        }
    }
}
