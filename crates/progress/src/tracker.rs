//! Workflow tracking - the sole mutator of one workflow run.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use flowtrack_core::{
    validate_transition, EventData, EventKind, Milestone, MilestoneKind, ProgressWeighting,
    Result, Scope, Step, StepSpec, Timestamp, TrackerError, TrackerEvent, Workflow, WorkflowId,
    WorkflowState,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use crate::estimator::Bottleneck;

/// Observer invoked for every state change.
///
/// Errors are logged and otherwise ignored; they never undo the change that
/// triggered the event.
pub type Callback = Box<dyn FnMut(&TrackerEvent) -> anyhow::Result<()> + Send>;

/// Configuration for a tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// How sibling steps are weighted in overall progress
    #[serde(default)]
    pub weighting: ProgressWeighting,
}

/// Tracks the state of one workflow run and notifies observers.
///
/// Every mutator validates before it touches anything, so a failed call
/// leaves the workflow exactly as it was. Callbacks run synchronously, in
/// registration order, after the change has been applied.
///
/// Callbacks must not call back into the tracker that invoked them; there is
/// no reentrancy guard.
pub struct WorkflowTracker {
    workflow: Workflow,
    config: TrackerConfig,
    callbacks: Vec<Callback>,
}

impl WorkflowTracker {
    /// Create a tracker for a new, empty workflow.
    pub fn new(workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            workflow: Workflow::new(workflow_id),
            config: TrackerConfig::default(),
            callbacks: Vec::new(),
        }
    }

    /// Create a tracker with a generated workflow id.
    pub fn generate() -> Self {
        Self::new(WorkflowId::generate())
    }

    /// Resume tracking a restored workflow. The snapshot is validated first.
    pub fn from_workflow(workflow: Workflow) -> Result<Self> {
        workflow.validate()?;
        Ok(Self {
            workflow,
            config: TrackerConfig::default(),
            callbacks: Vec::new(),
        })
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The tracked workflow.
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Workflow id.
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow.workflow_id
    }

    /// Current workflow state.
    pub fn state(&self) -> WorkflowState {
        self.workflow.state
    }

    /// Look up a step.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.workflow.step(id)
    }

    /// Direct children of `parent_id`, in insertion order.
    pub fn get_substeps(&self, parent_id: &str) -> Vec<&Step> {
        self.workflow.substeps(parent_id).collect()
    }

    /// Milestones reached so far.
    pub fn milestones(&self) -> &[Milestone] {
        &self.workflow.milestones
    }

    /// Overall progress in `[0, 1]`, weighted per the configuration.
    pub fn get_overall_progress(&self) -> f64 {
        self.workflow.overall_progress(self.config.weighting)
    }

    /// Attach caller metadata to the workflow.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.workflow.metadata.insert(key.into(), value);
    }

    /// Register an observer. Observers run in registration order.
    pub fn add_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&TrackerEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    // ---- structure ----

    /// Add a step. Only allowed before the workflow starts.
    pub fn add_step(
        &mut self,
        id: &str,
        title: &str,
        parent_id: Option<&str>,
        estimated_duration: Option<f64>,
    ) -> Result<()> {
        let mut spec = StepSpec::new(id, title);
        spec.parent_id = parent_id.map(str::to_string);
        spec.estimated_duration = estimated_duration;
        self.add_step_with(spec)
    }

    /// Add a step described by a [`StepSpec`].
    pub fn add_step_with(&mut self, spec: StepSpec) -> Result<()> {
        self.ensure_state(WorkflowState::Pending, "add a step")?;
        if self.workflow.steps.contains_key(&spec.id) {
            return Err(TrackerError::DuplicateId(spec.id));
        }
        if let Some(parent) = &spec.parent_id {
            if !self.workflow.steps.contains_key(parent) {
                return Err(TrackerError::UnknownParent {
                    step_id: spec.id,
                    parent_id: parent.clone(),
                });
            }
        }

        let mut step = spec.into_step();
        step.estimated_duration = step.estimated_duration.filter(|d| d.is_finite() && *d >= 0.0);
        debug!("Added step {} to workflow {}", step.id, self.workflow.workflow_id);
        self.workflow.step_order.push(step.id.clone());
        self.workflow.steps.insert(step.id.clone(), step);
        Ok(())
    }

    // ---- workflow lifecycle ----

    /// Start the workflow.
    pub fn start_workflow(&mut self) -> Result<()> {
        let now = Timestamp::now();
        self.transition_workflow(WorkflowState::InProgress)?;
        self.workflow.started_at = Some(now);
        info!("Workflow {} started", self.workflow.workflow_id);

        let mut events = vec![self.event(EventKind::Started, now)];
        events.extend(self.check_milestones(now));
        self.dispatch(events);
        Ok(())
    }

    /// Complete the workflow.
    pub fn complete_workflow(&mut self) -> Result<()> {
        let now = Timestamp::now();
        self.transition_workflow(WorkflowState::Completed)?;
        let duration = self.finish_workflow(now);
        info!(
            "Workflow {} completed in {:.2}s",
            self.workflow.workflow_id, duration
        );

        let mut events = vec![self
            .event(EventKind::Completed, now)
            .with_data(EventData::Finished { duration_seconds: Some(duration) })];
        if !self.workflow.has_milestone(MilestoneKind::Completed) {
            let message = format!(
                "Workflow {} completed in {:.2}s",
                self.workflow.workflow_id, duration
            );
            events.push(self.reach(Milestone::new(MilestoneKind::Completed, now, message)));
        }
        self.dispatch(events);
        Ok(())
    }

    /// Fail the workflow.
    pub fn fail_workflow(&mut self, error: &str) -> Result<()> {
        let now = Timestamp::now();
        self.transition_workflow(WorkflowState::Failed)?;
        self.workflow.error = Some(error.to_string());
        self.finish_workflow(now);
        info!("Workflow {} failed: {}", self.workflow.workflow_id, error);

        let failed = Milestone::new(
            MilestoneKind::Failed,
            now,
            format!("Workflow {} failed: {}", self.workflow.workflow_id, error),
        );
        let events = vec![
            self.event(EventKind::Failed, now).with_data(EventData::Failure {
                error: Some(error.to_string()),
            }),
            self.reach(failed),
        ];
        self.dispatch(events);
        Ok(())
    }

    /// Cancel the workflow, running or paused.
    pub fn cancel_workflow(&mut self) -> Result<()> {
        let now = Timestamp::now();
        self.transition_workflow(WorkflowState::Cancelled)?;
        let duration = self.finish_workflow(now);
        info!("Workflow {} cancelled", self.workflow.workflow_id);

        let event = self
            .event(EventKind::Cancelled, now)
            .with_data(EventData::Finished { duration_seconds: Some(duration) });
        self.dispatch(vec![event]);
        Ok(())
    }

    /// Pause the workflow. Step states are left alone.
    pub fn pause_workflow(&mut self) -> Result<()> {
        let now = Timestamp::now();
        self.transition_workflow(WorkflowState::Paused)?;
        info!("Workflow {} paused", self.workflow.workflow_id);
        self.dispatch(vec![self.event(EventKind::Paused, now)]);
        Ok(())
    }

    /// Resume a paused workflow.
    pub fn resume_workflow(&mut self) -> Result<()> {
        let now = Timestamp::now();
        self.transition_workflow(WorkflowState::InProgress)?;
        info!("Workflow {} resumed", self.workflow.workflow_id);
        self.dispatch(vec![self.event(EventKind::Resumed, now)]);
        Ok(())
    }

    // ---- step lifecycle ----

    /// Start a pending step.
    pub fn start_step(&mut self, id: &str) -> Result<()> {
        let now = Timestamp::now();
        self.ensure_state(WorkflowState::InProgress, "start a step")?;
        let step = self.transition_step(id, WorkflowState::InProgress)?;
        step.started_at = Some(now);

        self.dispatch(vec![self.step_event(EventKind::StepStarted, id, now)]);
        Ok(())
    }

    /// Set a running step's progress. Out-of-range values are clamped.
    pub fn update_step_progress(&mut self, id: &str, fraction: f64) -> Result<()> {
        let now = Timestamp::now();
        self.ensure_state(WorkflowState::InProgress, "update step progress")?;
        let step = self.find_step(id)?;
        if step.state != WorkflowState::InProgress {
            return Err(TrackerError::InvalidStepState {
                step_id: id.to_string(),
                state: step.state,
                operation: "update progress of",
            });
        }

        let fraction = clamp_fraction(fraction);
        self.step_mut(id)?.progress_fraction = fraction;
        debug!("Step {} progress {:.3}", id, fraction);

        let mut events = vec![self
            .step_event(EventKind::StepProgress, id, now)
            .with_data(EventData::Progress { progress_fraction: fraction })];
        events.extend(self.check_milestones(now));
        self.dispatch(events);
        Ok(())
    }

    /// Complete a running step.
    pub fn complete_step(&mut self, id: &str) -> Result<()> {
        let now = Timestamp::now();
        self.ensure_state(WorkflowState::InProgress, "complete a step")?;
        let step = self.transition_step(id, WorkflowState::Completed)?;
        step.progress_fraction = 1.0;
        let (duration, title) = finish_step(step, now);

        let done = Milestone::new(
            MilestoneKind::StepComplete,
            now,
            format!("Step '{}' completed", title),
        )
        .for_step(id);
        let mut events = vec![
            self.step_event(EventKind::StepCompleted, id, now)
                .with_data(EventData::Finished { duration_seconds: duration }),
            self.reach(done),
        ];
        events.extend(self.check_milestones(now));
        self.dispatch(events);
        Ok(())
    }

    /// Fail a running step.
    pub fn fail_step(&mut self, id: &str, error: Option<&str>) -> Result<()> {
        let now = Timestamp::now();
        self.ensure_state(WorkflowState::InProgress, "fail a step")?;
        let step = self.transition_step(id, WorkflowState::Failed)?;
        step.error = error.map(str::to_string);
        let (_, title) = finish_step(step, now);

        let failed = Milestone::new(
            MilestoneKind::Failed,
            now,
            format!("Step '{}' failed: {}", title, error.unwrap_or("Unknown error")),
        )
        .for_step(id);
        let events = vec![
            self.step_event(EventKind::StepFailed, id, now)
                .with_data(EventData::Failure { error: error.map(str::to_string) }),
            self.reach(failed),
        ];
        self.dispatch(events);
        Ok(())
    }

    /// Pause a running step. Its progress is kept.
    pub fn pause_step(&mut self, id: &str) -> Result<()> {
        let now = Timestamp::now();
        self.ensure_not_terminal("pause a step")?;
        self.transition_step(id, WorkflowState::Paused)?;
        self.dispatch(vec![self.step_event(EventKind::StepPaused, id, now)]);
        Ok(())
    }

    /// Resume a paused step.
    pub fn resume_step(&mut self, id: &str) -> Result<()> {
        let now = Timestamp::now();
        self.ensure_state(WorkflowState::InProgress, "resume a step")?;
        self.transition_step(id, WorkflowState::InProgress)?;
        self.dispatch(vec![self.step_event(EventKind::StepResumed, id, now)]);
        Ok(())
    }

    /// Cancel a paused step.
    pub fn cancel_step(&mut self, id: &str) -> Result<()> {
        let now = Timestamp::now();
        self.ensure_not_terminal("cancel a step")?;
        let step = self.transition_step(id, WorkflowState::Cancelled)?;
        let (duration, _) = finish_step(step, now);

        let event = self
            .step_event(EventKind::StepCancelled, id, now)
            .with_data(EventData::Finished { duration_seconds: duration });
        self.dispatch(vec![event]);
        Ok(())
    }

    /// Record a bottleneck reported by an estimator as a milestone.
    ///
    /// The tracker never detects bottlenecks itself. Each step is reported
    /// at most once; returns `false` when the step already has a bottleneck
    /// milestone and nothing was emitted.
    pub fn report_bottleneck(&mut self, bottleneck: &Bottleneck) -> Result<bool> {
        let now = Timestamp::now();
        self.ensure_not_terminal("report a bottleneck")?;
        self.find_step(&bottleneck.step_id)?;

        let already_reported = self.workflow.milestones.iter().any(|m| {
            m.kind == MilestoneKind::Bottleneck
                && m.step_id.as_deref() == Some(bottleneck.step_id.as_str())
        });
        if already_reported {
            debug!("Bottleneck on step {} already reported", bottleneck.step_id);
            return Ok(false);
        }

        let details = serde_json::to_value(bottleneck)?;
        let milestone = Milestone::new(
            MilestoneKind::Bottleneck,
            now,
            format!(
                "Step '{}' is running {:.0}% over its expected {:.1}s",
                bottleneck.step_title,
                bottleneck.deviation_percent * 100.0,
                bottleneck.expected_duration
            ),
        )
        .for_step(&bottleneck.step_id)
        .with_details(details);
        let event = self.reach(milestone);
        self.dispatch(vec![event]);
        Ok(true)
    }

    // ---- snapshots ----

    /// Serialize the full workflow.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.workflow)?)
    }

    /// Restore from a value produced by [`WorkflowTracker::to_value`].
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let workflow: Workflow = serde_json::from_value(value)?;
        Self::from_workflow(workflow)
    }

    /// Restore from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let workflow: Workflow = serde_json::from_str(json)?;
        Self::from_workflow(workflow)
    }

    /// Write the workflow as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.workflow)?;
        std::fs::write(path, json)?;
        debug!("Saved workflow {} to {}", self.workflow.workflow_id, path.display());
        Ok(())
    }

    /// Read a workflow written by [`WorkflowTracker::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    // ---- internals ----

    fn ensure_state(&self, expected: WorkflowState, operation: &'static str) -> Result<()> {
        if self.workflow.state == expected {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn ensure_not_terminal(&self, operation: &'static str) -> Result<()> {
        if self.workflow.state.is_terminal() {
            Err(self.invalid_state(operation))
        } else {
            Ok(())
        }
    }

    fn invalid_state(&self, operation: &'static str) -> TrackerError {
        TrackerError::InvalidState {
            workflow_id: self.workflow.workflow_id.to_string(),
            state: self.workflow.state,
            operation,
        }
    }

    fn find_step(&self, id: &str) -> Result<&Step> {
        self.workflow
            .steps
            .get(id)
            .ok_or_else(|| TrackerError::UnknownStep(id.to_string()))
    }

    fn step_mut(&mut self, id: &str) -> Result<&mut Step> {
        self.workflow
            .steps
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownStep(id.to_string()))
    }

    fn transition_workflow(&mut self, to: WorkflowState) -> Result<()> {
        let from = self.workflow.state;
        validate_transition(Scope::Workflow, self.workflow.workflow_id.as_str(), from, to)?;
        self.workflow.state = to;
        debug!("Workflow {}: {} -> {}", self.workflow.workflow_id, from, to);
        Ok(())
    }

    fn transition_step(&mut self, id: &str, to: WorkflowState) -> Result<&mut Step> {
        let step = self.step_mut(id)?;
        let from = step.state;
        validate_transition(Scope::Step, id, from, to)?;
        step.state = to;
        debug!("Step {}: {} -> {}", id, from, to);
        Ok(step)
    }

    /// Stamp the end time and return the run's duration.
    fn finish_workflow(&mut self, now: Timestamp) -> f64 {
        let started = self.workflow.started_at.unwrap_or(now);
        let ended = now.max(started);
        self.workflow.ended_at = Some(ended);
        ended.seconds_since(started)
    }

    /// Emit every progress milestone whose threshold has been reached.
    fn check_milestones(&mut self, now: Timestamp) -> Vec<TrackerEvent> {
        let progress = self.get_overall_progress();
        let mut events = Vec::new();
        for kind in MilestoneKind::PROGRESS {
            let Some(threshold) = kind.threshold() else {
                continue;
            };
            if progress < threshold || self.workflow.has_milestone(kind) {
                continue;
            }
            let message = match kind {
                MilestoneKind::Started => format!("Workflow {} started", self.workflow.workflow_id),
                MilestoneKind::Halfway => "Halfway there".to_string(),
                MilestoneKind::AlmostDone => "Almost done".to_string(),
                _ => "All steps completed".to_string(),
            };
            let milestone = Milestone::new(kind, now, message)
                .with_details(serde_json::json!({ "progress": progress }));
            events.push(self.reach(milestone));
        }
        events
    }

    /// Record a milestone and build its event.
    fn reach(&mut self, milestone: Milestone) -> TrackerEvent {
        debug!("Workflow {} milestone {:?}", self.workflow.workflow_id, milestone.kind);
        let mut event = self.event(EventKind::Milestone, milestone.timestamp);
        event.step_id = milestone.step_id.clone();
        self.workflow.milestones.push(milestone.clone());
        event.with_data(EventData::Milestone { milestone })
    }

    fn event(&self, kind: EventKind, now: Timestamp) -> TrackerEvent {
        TrackerEvent::new(kind, self.workflow.workflow_id.clone(), now)
    }

    fn step_event(&self, kind: EventKind, id: &str, now: Timestamp) -> TrackerEvent {
        self.event(kind, now).for_step(id)
    }

    fn dispatch(&mut self, events: Vec<TrackerEvent>) {
        for event in &events {
            for (idx, callback) in self.callbacks.iter_mut().enumerate() {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(
                        "Callback {} failed on {} for workflow {}: {:#}",
                        idx, event.kind, event.workflow_id, e
                    ),
                    Err(payload) => error!(
                        "Callback {} panicked on {} for workflow {}: {}",
                        idx,
                        event.kind,
                        event.workflow_id,
                        panic_message(payload.as_ref())
                    ),
                }
            }
        }
    }
}

impl AsRef<Workflow> for WorkflowTracker {
    fn as_ref(&self) -> &Workflow {
        &self.workflow
    }
}

impl std::fmt::Debug for WorkflowTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowTracker")
            .field("workflow", &self.workflow)
            .field("config", &self.config)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

/// Stamp a step's end time; returns its duration and title.
fn finish_step(step: &mut Step, now: Timestamp) -> (Option<f64>, String) {
    let ended = match step.started_at {
        Some(start) => now.max(start),
        None => now,
    };
    step.ended_at = Some(ended);
    (step.duration(), step.title.clone())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
