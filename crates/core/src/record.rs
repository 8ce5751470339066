//! History record - the persisted outcome of one finished run.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::error::{Result, TrackerError};
use crate::id::WorkflowId;
use crate::state::WorkflowState;
use crate::time::Timestamp;
use crate::workflow::Workflow;

/// Slack allowed between `duration_seconds` and the timestamps it spans.
const DURATION_TOLERANCE: f64 = 1e-3;

/// One terminal workflow run, as stored in the history log.
///
/// Records are built once, when the run ends, and never change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Label grouping comparable runs (e.g. `deploy`)
    pub workflow_type: String,

    /// Run id
    pub workflow_id: WorkflowId,

    /// Terminal state the run ended in
    pub final_state: WorkflowState,

    /// Start time
    pub started_at: Timestamp,

    /// End time
    pub ended_at: Timestamp,

    /// `ended_at - started_at`
    pub duration_seconds: f64,

    /// Observed duration per completed step
    pub step_durations: BTreeMap<String, f64>,

    /// Number of steps in the run
    #[serde(default)]
    pub step_count: usize,

    /// Steps that completed
    #[serde(default)]
    pub completed_steps: usize,

    /// Steps that failed
    #[serde(default)]
    pub failed_steps: usize,

    /// Caller metadata attached to the run
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl HistoryRecord {
    /// Build a record from a finished workflow.
    ///
    /// Returns `None` unless the workflow is in a terminal state. Only
    /// completed steps contribute to `step_durations`; failed or cancelled
    /// steps would skew later estimates.
    pub fn from_workflow(workflow: &Workflow, workflow_type: impl Into<String>) -> Option<Self> {
        if !workflow.state.is_terminal() {
            return None;
        }
        let ended_at = workflow.ended_at?;
        let started_at = workflow.started_at.unwrap_or(ended_at);

        let step_durations = workflow
            .ordered_steps()
            .filter(|s| s.is_complete())
            .filter_map(|s| s.duration().map(|d| (s.id.clone(), d)))
            .collect();

        Some(Self {
            workflow_type: workflow_type.into(),
            workflow_id: workflow.workflow_id.clone(),
            final_state: workflow.state,
            started_at,
            ended_at,
            duration_seconds: ended_at.seconds_since(started_at),
            step_durations,
            step_count: workflow.steps.len(),
            completed_steps: workflow.steps.values().filter(|s| s.is_complete()).count(),
            failed_steps: workflow
                .steps
                .values()
                .filter(|s| s.state == WorkflowState::Failed)
                .count(),
            metadata: workflow.metadata.clone(),
        })
    }

    /// Check the record's invariants: terminal final state, ordered finite
    /// timestamps, a duration matching them, and non-negative step durations.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TrackerError::InvalidRecord(msg));

        if !self.final_state.is_terminal() {
            return invalid(format!("final state {} is not terminal", self.final_state));
        }
        if !self.started_at.is_finite() || !self.ended_at.is_finite() {
            return invalid("non-finite timestamp".to_string());
        }
        if self.ended_at < self.started_at {
            return invalid(format!(
                "ends ({}) before it starts ({})",
                self.ended_at, self.started_at
            ));
        }
        let span = self.ended_at.seconds_since(self.started_at);
        if !self.duration_seconds.is_finite()
            || (self.duration_seconds - span).abs() > DURATION_TOLERANCE
        {
            return invalid(format!(
                "duration {} does not match ended_at - started_at ({span})",
                self.duration_seconds
            ));
        }
        if let Some((id, d)) = self
            .step_durations
            .iter()
            .find(|(_, d)| !d.is_finite() || **d < 0.0)
        {
            return invalid(format!("step '{id}' has invalid duration {d}"));
        }
        Ok(())
    }

    /// Check if the run completed successfully.
    pub fn is_completed(&self) -> bool {
        self.final_state == WorkflowState::Completed
    }
}
