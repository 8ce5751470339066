//! flowtrack core data models.
//!
//! This crate defines the workflow and step records, the state machine
//! both of them follow, and the history record persisted for finished runs.

#![warn(missing_docs)]

// Identities and time
mod id;
mod time;

// State machine and errors
mod error;
mod state;

// Workflow structure
mod step;
mod workflow;
mod milestone;
mod event;

// Persisted outcome
mod record;

pub use id::WorkflowId;
pub use time::Timestamp;
pub use error::{Result, TrackerError};
pub use state::{is_allowed, validate_transition, Scope, WorkflowState};
pub use step::{Step, StepSpec};
pub use workflow::{ProgressWeighting, Workflow};
pub use milestone::{Milestone, MilestoneKind};
pub use event::{EventData, EventKind, TrackerEvent};
pub use record::HistoryRecord;
