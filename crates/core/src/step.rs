//! Step model - one unit of work inside a workflow.

use serde::{Deserialize, Serialize};
use crate::state::WorkflowState;
use crate::time::Timestamp;

/// A single unit of work, optionally nested under a parent step.
///
/// The parent relation is a lookup key into the owning workflow's step map,
/// never a pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow; substeps use dotted ids such as `deploy.1`
    pub id: String,

    /// Display title
    pub title: String,

    /// Longer description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Parent step id
    pub parent_id: Option<String>,

    /// Current state
    pub state: WorkflowState,

    /// Caller-supplied estimate in seconds
    pub estimated_duration: Option<f64>,

    /// Fraction done, always within `[0, 1]`
    pub progress_fraction: f64,

    /// When the step started
    pub started_at: Option<Timestamp>,

    /// When the step reached a terminal state
    pub ended_at: Option<Timestamp>,

    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    /// Create a pending step.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            parent_id: None,
            state: WorkflowState::Pending,
            estimated_duration: None,
            progress_fraction: 0.0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    /// Observed duration, once the step has both timestamps.
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.seconds_since(start)),
            _ => None,
        }
    }

    /// Time spent so far: the full duration if ended, otherwise up to `now`.
    pub fn elapsed(&self, now: Timestamp) -> Option<f64> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or(now);
        Some(end.seconds_since(start).max(0.0))
    }

    /// Progress counted toward the workflow: completed steps count in full.
    pub fn effective_progress(&self) -> f64 {
        if self.state == WorkflowState::Completed {
            1.0
        } else {
            self.progress_fraction
        }
    }

    /// Check if the step finished successfully.
    pub fn is_complete(&self) -> bool {
        self.state == WorkflowState::Completed
    }

    /// Check if the step is currently running.
    pub fn is_running(&self) -> bool {
        self.state == WorkflowState::InProgress
    }
}

/// Parameters for adding a step to a workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepSpec {
    /// Step id
    pub id: String,
    /// Display title
    pub title: String,
    /// Longer description
    pub description: String,
    /// Parent step id
    pub parent_id: Option<String>,
    /// Estimate in seconds
    pub estimated_duration: Option<f64>,
}

impl StepSpec {
    /// Start a spec with the required fields.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    /// Nest under a parent step.
    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Attach an a priori estimate in seconds.
    pub fn estimated(mut self, seconds: f64) -> Self {
        self.estimated_duration = Some(seconds);
        self
    }

    /// Attach a description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Materialize as a pending step.
    pub fn into_step(self) -> Step {
        let mut step = Step::new(self.id, self.title);
        step.description = self.description;
        step.parent_id = self.parent_id;
        step.estimated_duration = self.estimated_duration;
        step
    }
}
