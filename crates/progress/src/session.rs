//! Workflow session - one tracked run wired to history and estimation.

use flowtrack_core::{HistoryRecord, Timestamp};
use flowtrack_storage::WorkflowHistory;
use tracing::{error, info, warn};
use crate::error::Result;
use crate::estimator::{Bottleneck, Estimate, TimeEstimator};
use crate::tracker::WorkflowTracker;

/// A single run of a workflow type.
///
/// Owns the tracker for the run together with the history it is estimated
/// against and logged to when it ends.
#[derive(Debug)]
pub struct WorkflowSession {
    tracker: WorkflowTracker,
    history: WorkflowHistory,
    estimator: TimeEstimator,
    workflow_type: String,
}

impl WorkflowSession {
    /// Create a session around a tracker.
    pub fn new(
        tracker: WorkflowTracker,
        history: WorkflowHistory,
        workflow_type: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            history,
            estimator: TimeEstimator::default(),
            workflow_type: workflow_type.into(),
        }
    }

    /// Set the estimator.
    pub fn with_estimator(mut self, estimator: TimeEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Workflow type runs are grouped under.
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// The tracker.
    pub fn tracker(&self) -> &WorkflowTracker {
        &self.tracker
    }

    /// The tracker, for step updates.
    pub fn tracker_mut(&mut self) -> &mut WorkflowTracker {
        &mut self.tracker
    }

    /// The history.
    pub fn history(&self) -> &WorkflowHistory {
        &self.history
    }

    /// Start the run.
    pub fn start(&mut self) -> Result<()> {
        self.tracker.start_workflow()?;
        Ok(())
    }

    /// Estimate completion as of now.
    pub fn estimate(&self) -> Estimate {
        self.estimator
            .estimate(&self.tracker, &self.history, &self.workflow_type)
    }

    /// Estimate completion as of `now`.
    pub fn estimate_at(&self, now: Timestamp) -> Estimate {
        self.estimator
            .estimate_at(&self.tracker, &self.history, &self.workflow_type, now)
    }

    /// Detect bottlenecks and relay each newly overrunning step to the
    /// tracker as a milestone. Returns every bottleneck currently detected.
    pub fn check_bottlenecks(&mut self) -> Result<Vec<Bottleneck>> {
        let found = self
            .estimator
            .bottlenecks(&self.tracker, &self.history, &self.workflow_type);
        for bottleneck in &found {
            if self.tracker.report_bottleneck(bottleneck)? {
                warn!(
                    "Bottleneck in {}: step {} is {:.0}% over",
                    self.tracker.workflow_id(),
                    bottleneck.step_id,
                    bottleneck.deviation_percent * 100.0
                );
            }
        }
        Ok(found)
    }

    /// Complete the run and log it.
    pub fn finish(&mut self) -> Result<HistoryRecord> {
        self.tracker.complete_workflow()?;
        self.log()
    }

    /// Fail the run and log it.
    pub fn abort(&mut self, error: &str) -> Result<HistoryRecord> {
        self.tracker.fail_workflow(error)?;
        self.log()
    }

    /// Cancel the run and log it.
    pub fn cancel(&mut self) -> Result<HistoryRecord> {
        self.tracker.cancel_workflow()?;
        self.log()
    }

    /// Start the run, execute `body`, then finish or abort it.
    ///
    /// An `Ok` from `body` completes and logs the run; an `Err` fails it with
    /// the error's message and is returned unchanged.
    pub fn run<T, F>(&mut self, body: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Self) -> anyhow::Result<T>,
    {
        self.start()?;
        match body(self) {
            Ok(value) => {
                self.finish()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = self.abort(&e.to_string()) {
                    error!(
                        "Failed to abort session {}: {}",
                        self.tracker.workflow_id(),
                        abort_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Split into tracker and history.
    pub fn into_parts(self) -> (WorkflowTracker, WorkflowHistory) {
        (self.tracker, self.history)
    }

    fn log(&mut self) -> Result<HistoryRecord> {
        let record = self.history.log_workflow(&self.tracker, &self.workflow_type)?;
        info!(
            "Session {} ({}) ended {}",
            record.workflow_id, self.workflow_type, record.final_state
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtrack_core::{MilestoneKind, StepSpec, Workflow, WorkflowState};
    use crate::error::SessionError;
    use flowtrack_storage::HistoryError;

    fn session() -> WorkflowSession {
        let mut tracker = WorkflowTracker::new("run-1");
        tracker.add_step("init", "Init", None, Some(1.0)).unwrap();
        tracker.add_step("build", "Build", None, Some(2.0)).unwrap();
        WorkflowSession::new(tracker, WorkflowHistory::in_memory(), "deploy")
    }

    #[test]
    fn test_finish_logs_completed_run() {
        let mut session = session();
        session.start().unwrap();
        for id in ["init", "build"] {
            session.tracker_mut().start_step(id).unwrap();
            session.tracker_mut().complete_step(id).unwrap();
        }
        let record = session.finish().unwrap();

        assert_eq!(record.final_state, WorkflowState::Completed);
        assert_eq!(record.workflow_type, "deploy");
        assert_eq!(record.step_durations.len(), 2);
        assert_eq!(session.history().len(), 1);
        assert!(session.history().get_average_duration("deploy").is_some());
    }

    #[test]
    fn test_abort_logs_failed_run() {
        let mut session = session();
        session.start().unwrap();
        session.tracker_mut().start_step("init").unwrap();
        let record = session.abort("network unreachable").unwrap();

        assert_eq!(record.final_state, WorkflowState::Failed);
        assert!(record.step_durations.is_empty());
        let stats = session.history().get_stats("deploy");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn test_finish_before_start_fails_without_logging() {
        let mut session = session();
        assert!(matches!(session.finish(), Err(SessionError::Tracker(_))));
        assert!(session.history().is_empty());
    }

    #[test]
    fn test_log_errors_surface() {
        let mut session = session();
        session.start().unwrap();
        session.cancel().unwrap();
        // Already terminal: the tracker refuses before history is touched
        assert!(matches!(session.cancel(), Err(SessionError::Tracker(_))));

        let (tracker, mut history) = session.into_parts();
        let mut running = WorkflowTracker::new("run-2");
        running.start_workflow().unwrap();
        assert!(matches!(
            history.log_workflow(&running, "deploy"),
            Err(HistoryError::NotTerminal { .. })
        ));
        assert_eq!(tracker.state(), WorkflowState::Cancelled);
    }

    #[test]
    fn test_check_bottlenecks_relays_milestones() {
        let now = Timestamp::now();
        let mut wf = Workflow::new("run-b");
        for spec in [
            StepSpec::new("slow", "Slow").estimated(10.0),
            StepSpec::new("fine", "Fine").estimated(1_000.0),
        ] {
            let mut step = spec.into_step();
            step.state = WorkflowState::InProgress;
            step.started_at = Some(now.offset(-100.0));
            wf.step_order.push(step.id.clone());
            wf.steps.insert(step.id.clone(), step);
        }
        wf.state = WorkflowState::InProgress;
        wf.started_at = Some(now.offset(-100.0));

        let tracker = WorkflowTracker::from_workflow(wf).unwrap();
        let mut session = WorkflowSession::new(tracker, WorkflowHistory::in_memory(), "deploy");
        let found = session.check_bottlenecks().unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].step_id, "slow");
        let relayed: Vec<_> = session
            .tracker()
            .milestones()
            .iter()
            .filter(|m| m.kind == MilestoneKind::Bottleneck)
            .collect();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].step_id.as_deref(), Some("slow"));

        for _ in 0..4 {
            assert_eq!(session.check_bottlenecks().unwrap().len(), 1);
        }
        let relayed = session
            .tracker()
            .milestones()
            .iter()
            .filter(|m| m.kind == MilestoneKind::Bottleneck)
            .count();
        assert_eq!(relayed, 1);
    }

    #[test]
    fn test_run_finishes_on_success() {
        let mut session = session();
        let value = session
            .run(|s| {
                for id in ["init", "build"] {
                    s.tracker_mut().start_step(id)?;
                    s.tracker_mut().complete_step(id)?;
                }
                Ok(7)
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(session.tracker().state(), WorkflowState::Completed);
        let logged = session.history().recent(Some("deploy"), 1);
        assert_eq!(logged[0].final_state, WorkflowState::Completed);
    }

    #[test]
    fn test_run_aborts_on_error() {
        let mut session = session();
        let result: anyhow::Result<()> = session.run(|s| {
            s.tracker_mut().start_step("init")?;
            anyhow::bail!("disk full")
        });

        assert_eq!(result.unwrap_err().to_string(), "disk full");
        assert_eq!(session.tracker().state(), WorkflowState::Failed);
        assert_eq!(session.tracker().workflow().error.as_deref(), Some("disk full"));
        let stats = session.history().get_stats("deploy");
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_estimate_uses_logged_history() {
        let mut history = WorkflowHistory::in_memory();
        for i in 0..3 {
            let mut tracker = WorkflowTracker::new(format!("past-{i}"));
            tracker.add_step("init", "Init", None, None).unwrap();
            tracker.start_workflow().unwrap();
            tracker.start_step("init").unwrap();
            tracker.complete_step("init").unwrap();
            tracker.complete_workflow().unwrap();
            history.log_workflow(&tracker, "deploy").unwrap();
        }

        let mut tracker = WorkflowTracker::new("live");
        tracker.add_step("init", "Init", None, None).unwrap();
        let mut session = WorkflowSession::new(tracker, history, "deploy");
        session.start().unwrap();

        let estimate = session.estimate_at(Timestamp::now());
        assert_eq!(estimate.based_on_samples, 3);
        assert!(estimate.confidence > 0.0 && estimate.confidence <= 0.95);
        assert!(estimate.estimated_remaining >= 0.0);
        assert!(session.estimate().bottlenecks.is_empty());
    }
}
