//! History store trait abstraction.

use flowtrack_core::{HistoryRecord, WorkflowState};

/// Error type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Errors that can occur during history operations.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Only finished runs can be logged
    #[error("workflow '{workflow_id}' is {state}, not in a terminal state")]
    NotTerminal {
        /// Workflow id
        workflow_id: String,
        /// Its current state
        state: WorkflowState,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A history line that could not be parsed and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptLine {
    /// 1-based line number
    pub line: usize,
    /// Why it was rejected
    pub reason: String,
}

/// Result of reading a store: the good records plus what was skipped.
#[derive(Debug, Clone, Default)]
pub struct LoadedHistory {
    /// Records in insertion order
    pub records: Vec<HistoryRecord>,
    /// Lines skipped while loading
    pub corrupt: Vec<CorruptLine>,
}

/// Backing store for the append-only history log.
///
/// This trait allows different backends to be plugged in; the file-backed
/// [`crate::JsonlHistoryStore`] is the default.
pub trait HistoryStore: Send {
    /// Read every record. Unparseable entries are reported, not fatal.
    fn load(&self) -> Result<LoadedHistory>;

    /// Append one record durably.
    fn append(&mut self, record: &HistoryRecord) -> Result<()>;

    /// Drop every record.
    fn clear(&mut self) -> Result<()>;
}
