//! Milestones - notable points in a workflow run.

use serde::{Deserialize, Serialize};
use crate::time::Timestamp;

/// Kinds of milestones a workflow can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MilestoneKind {
    /// Workflow started (0%)
    Started,
    /// A step completed
    StepComplete,
    /// Overall progress reached 50%
    Halfway,
    /// Overall progress reached 85%
    AlmostDone,
    /// Overall progress reached 100%
    Completed,
    /// A step or the workflow failed
    Failed,
    /// An in-progress step runs longer than expected (relayed by the caller)
    Bottleneck,
}

impl MilestoneKind {
    /// Milestones driven by overall progress, in crossing order.
    pub const PROGRESS: [MilestoneKind; 4] = [
        MilestoneKind::Started,
        MilestoneKind::Halfway,
        MilestoneKind::AlmostDone,
        MilestoneKind::Completed,
    ];

    /// Overall-progress threshold for progress-driven milestones.
    pub fn threshold(self) -> Option<f64> {
        match self {
            MilestoneKind::Started => Some(0.0),
            MilestoneKind::Halfway => Some(0.5),
            MilestoneKind::AlmostDone => Some(0.85),
            MilestoneKind::Completed => Some(1.0),
            _ => None,
        }
    }
}

/// A milestone reached during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    /// Milestone kind
    pub kind: MilestoneKind,

    /// When it was reached
    pub timestamp: Timestamp,

    /// Human-readable message
    pub message: String,

    /// Step the milestone refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// Kind-specific details (bottleneck measurements, for instance)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl Milestone {
    /// Create a milestone without step or details.
    pub fn new(kind: MilestoneKind, timestamp: Timestamp, message: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp,
            message: message.into(),
            step_id: None,
            details: serde_json::Value::Null,
        }
    }

    /// Attach the step this milestone is about.
    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Attach details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
