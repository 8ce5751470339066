//! Errors for session-level operations.

use flowtrack_core::TrackerError;
use flowtrack_storage::HistoryError;

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors from a [`crate::WorkflowSession`], which touches both the tracker
/// and the history log.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Tracker rejected the operation
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// History could not be written
    #[error(transparent)]
    History(#[from] HistoryError),
}
