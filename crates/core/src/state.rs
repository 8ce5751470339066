//! Execution states and the transition table shared by steps and workflows.
//!
//! ```text
//! PENDING -> IN_PROGRESS -> COMPLETED   (terminal)
//!                        -> FAILED      (terminal)
//!            IN_PROGRESS <-> PAUSED
//!            PAUSED      -> CANCELLED   (terminal)
//!            IN_PROGRESS -> CANCELLED   (terminal, workflow only)
//! ```

use serde::{Deserialize, Serialize};
use crate::error::{Result, TrackerError};

/// Execution state of a workflow or one of its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Not started yet
    Pending,
    /// Running
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Suspended, can be resumed
    Paused,
    /// Abandoned before finishing
    Cancelled,
}

impl WorkflowState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Started but not finished.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }

    /// Wire name, as used in snapshots and history lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The workflow as a whole
    Workflow,
    /// A single step
    Step,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Workflow => f.write_str("workflow"),
            Scope::Step => f.write_str("step"),
        }
    }
}

/// Whether `from -> to` is an edge of the state graph for `scope`.
pub fn is_allowed(scope: Scope, from: WorkflowState, to: WorkflowState) -> bool {
    use WorkflowState::*;
    match (from, to) {
        (Pending, InProgress) => true,
        (InProgress, Completed) | (InProgress, Failed) => true,
        (InProgress, Paused) | (Paused, InProgress) => true,
        (Paused, Cancelled) => true,
        (InProgress, Cancelled) => scope == Scope::Workflow,
        _ => false,
    }
}

/// Check a transition, producing `InvalidTransition` naming both states.
///
/// Every mutator on the tracker goes through this before touching state.
pub fn validate_transition(
    scope: Scope,
    id: &str,
    from: WorkflowState,
    to: WorkflowState,
) -> Result<()> {
    if is_allowed(scope, from, to) {
        Ok(())
    } else {
        Err(TrackerError::InvalidTransition {
            scope,
            id: id.to_string(),
            from,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowState::*;

    const ALL: [WorkflowState; 6] = [Pending, InProgress, Completed, Failed, Paused, Cancelled];

    #[test]
    fn test_graph_edges() {
        let edges = [
            (Pending, InProgress),
            (InProgress, Completed),
            (InProgress, Failed),
            (InProgress, Paused),
            (Paused, InProgress),
            (Paused, Cancelled),
        ];
        for scope in [Scope::Workflow, Scope::Step] {
            for from in ALL {
                for to in ALL {
                    let expected = edges.contains(&(from, to))
                        || (scope == Scope::Workflow && from == InProgress && to == Cancelled);
                    assert_eq!(is_allowed(scope, from, to), expected, "{scope}: {from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!is_allowed(Scope::Workflow, from, to));
                assert!(!is_allowed(Scope::Step, from, to));
            }
        }
    }

    #[test]
    fn test_step_cannot_cancel_while_running() {
        let err = validate_transition(Scope::Step, "build", InProgress, Cancelled).unwrap_err();
        match err {
            TrackerError::InvalidTransition { scope, id, from, to } => {
                assert_eq!(scope, Scope::Step);
                assert_eq!(id, "build");
                assert_eq!(from, InProgress);
                assert_eq!(to, Cancelled);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(validate_transition(Scope::Workflow, "run", InProgress, Cancelled).is_ok());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&InProgress).unwrap(), "\"IN_PROGRESS\"");
        let parsed: WorkflowState = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(parsed, Cancelled);
        assert_eq!(InProgress.to_string(), "IN_PROGRESS");
    }
}
