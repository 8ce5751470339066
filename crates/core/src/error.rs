//! Errors raised by workflow mutations and snapshot handling.

use crate::state::{Scope, WorkflowState};

/// Result alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors that can occur while mutating or restoring a workflow.
///
/// None of these are retried; a failed operation leaves the workflow as it
/// was before the call.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// State change outside the transition graph
    #[error("invalid transition for {scope} '{id}': {from} -> {to}")]
    InvalidTransition {
        /// Workflow or step
        scope: Scope,
        /// Workflow id or step id
        id: String,
        /// Current state
        from: WorkflowState,
        /// Attempted state
        to: WorkflowState,
    },

    /// Operation not permitted in the workflow's current state
    #[error("cannot {operation} while workflow '{workflow_id}' is {state}")]
    InvalidState {
        /// Workflow id
        workflow_id: String,
        /// Current workflow state
        state: WorkflowState,
        /// What was attempted
        operation: &'static str,
    },

    /// Operation not permitted in the step's current state
    #[error("cannot {operation} step '{step_id}' while it is {state}")]
    InvalidStepState {
        /// Step id
        step_id: String,
        /// Current step state
        state: WorkflowState,
        /// What was attempted
        operation: &'static str,
    },

    /// Step id already present
    #[error("step '{0}' already exists")]
    DuplicateId(String),

    /// Parent step id not present
    #[error("parent step '{parent_id}' of '{step_id}' does not exist")]
    UnknownParent {
        /// Step being added
        step_id: String,
        /// Missing parent
        parent_id: String,
    },

    /// Step id not present
    #[error("step '{0}' not found")]
    UnknownStep(String),

    /// Snapshot violates a workflow invariant
    #[error("invalid workflow snapshot: {0}")]
    InvalidSnapshot(String),

    /// History record violates a record invariant
    #[error("invalid history record: {0}")]
    InvalidRecord(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
