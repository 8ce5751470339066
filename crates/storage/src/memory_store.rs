//! In-memory history store, for ephemeral runs and tests.

use flowtrack_core::HistoryRecord;
use super::{HistoryStore, LoadedHistory, Result};

/// History store that keeps records in memory only.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistoryStore {
    records: Vec<HistoryRecord>,
}

impl MemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with records.
    pub fn with_records(records: Vec<HistoryRecord>) -> Self {
        Self { records }
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self) -> Result<LoadedHistory> {
        Ok(LoadedHistory {
            records: self.records.clone(),
            corrupt: Vec::new(),
        })
    }

    fn append(&mut self, record: &HistoryRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.records.clear();
        Ok(())
    }
}
