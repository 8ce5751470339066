//! Tracker events - what observers receive on every state change.

use serde::Serialize;
use crate::id::WorkflowId;
use crate::milestone::Milestone;
use crate::time::Timestamp;

/// Event types delivered to tracker callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Workflow started
    Started,
    /// Step started
    StepStarted,
    /// Step progress changed
    StepProgress,
    /// Step completed
    StepCompleted,
    /// Step failed
    StepFailed,
    /// Step paused
    StepPaused,
    /// Step resumed
    StepResumed,
    /// Step cancelled
    StepCancelled,
    /// Milestone reached
    Milestone,
    /// Workflow paused
    Paused,
    /// Workflow resumed
    Resumed,
    /// Workflow completed
    Completed,
    /// Workflow failed
    Failed,
    /// Workflow cancelled
    Cancelled,
}

impl EventKind {
    /// Wire name of the event type.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::StepStarted => "step_started",
            EventKind::StepProgress => "step_progress",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepFailed => "step_failed",
            EventKind::StepPaused => "step_paused",
            EventKind::StepResumed => "step_resumed",
            EventKind::StepCancelled => "step_cancelled",
            EventKind::Milestone => "milestone",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-specific payload fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    /// Progress update
    Progress {
        /// New fraction
        progress_fraction: f64,
    },
    /// Failure
    Failure {
        /// Failure message
        error: Option<String>,
    },
    /// Step or workflow reached a terminal state
    Finished {
        /// Observed duration
        duration_seconds: Option<f64>,
    },
    /// Milestone reached
    Milestone {
        /// The milestone
        milestone: Milestone,
    },
    /// No extra fields
    Empty {},
}

/// A state change as seen by observers.
///
/// Serializes to a flat object: `{event_type, workflow_id, step_id?,
/// timestamp, ...event fields}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerEvent {
    /// Event type
    #[serde(rename = "event_type")]
    pub kind: EventKind,

    /// Workflow the event belongs to
    pub workflow_id: WorkflowId,

    /// Step the event concerns, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// When it happened
    pub timestamp: Timestamp,

    /// Event-specific fields
    #[serde(flatten)]
    pub data: EventData,
}

impl TrackerEvent {
    /// Create an event with no extra fields.
    pub fn new(kind: EventKind, workflow_id: WorkflowId, timestamp: Timestamp) -> Self {
        Self {
            kind,
            workflow_id,
            step_id: None,
            timestamp,
            data: EventData::Empty {},
        }
    }

    /// Attach the step id.
    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Attach event-specific fields.
    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    /// The event as a JSON payload.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_payload_is_flat() {
        let event = TrackerEvent::new(
            EventKind::StepProgress,
            WorkflowId::new("run-1"),
            Timestamp::from_secs(10.0),
        )
        .for_step("build")
        .with_data(EventData::Progress { progress_fraction: 0.5 });

        let payload = event.payload();
        assert_eq!(payload["event_type"], "step_progress");
        assert_eq!(payload["workflow_id"], "run-1");
        assert_eq!(payload["step_id"], "build");
        assert_eq!(payload["timestamp"], 10.0);
        assert_eq!(payload["progress_fraction"], 0.5);
    }

    #[test]
    fn test_empty_payload_has_base_fields_only() {
        let event = TrackerEvent::new(
            EventKind::Started,
            WorkflowId::new("run-1"),
            Timestamp::from_secs(1.0),
        );
        let payload = event.payload();
        let obj = payload.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert!(obj.get("step_id").is_none());
    }

    #[test]
    fn test_kind_names_match_serde() {
        for kind in [EventKind::StepCompleted, EventKind::Milestone, EventKind::Cancelled] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }
}
