//! Completion time estimation.
//!
//! Expected step durations come from history first (the mean of at least
//! `min_samples` past observations of the same step id), then from the
//! step's own estimate. Remaining time is summed over leaf steps only, so a
//! parent's time is the time of its substeps.

use chrono::{DateTime, Utc};
use flowtrack_core::{Step, Timestamp, Workflow, WorkflowState};
use flowtrack_storage::WorkflowHistory;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard upper bound on any reported confidence.
pub const CONFIDENCE_CEILING: f64 = 0.95;

/// Configuration for the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Deviation above which a running step is a bottleneck (0.20 = 20% over)
    pub bottleneck_threshold: f64,
    /// Samples needed before history is trusted over a step's own estimate
    pub min_samples: usize,
    /// Upper bound on confidence
    pub max_confidence: f64,
    /// Sample count at which confidence reaches half of `max_confidence`
    pub confidence_half_samples: f64,
    /// Weight of estimate-only steps relative to history-backed ones
    pub fallback_penalty: f64,
    /// Cap applied when a step with no data contributed nothing
    pub unknown_step_confidence_cap: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            bottleneck_threshold: 0.20,
            min_samples: 2,
            max_confidence: 0.95,
            confidence_half_samples: 5.0,
            fallback_penalty: 0.5,
            unknown_step_confidence_cap: 0.5,
        }
    }
}

impl EstimatorConfig {
    /// Bring every field into its usable range.
    ///
    /// Non-finite values fall back to the default. Confidence bounds are
    /// clamped into `[0, CONFIDENCE_CEILING]`, `fallback_penalty` into
    /// `[0, 1]`, and a non-positive `confidence_half_samples` takes the
    /// default.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let finite_or = |v: f64, fallback: f64| if v.is_finite() { v } else { fallback };

        let half = finite_or(self.confidence_half_samples, defaults.confidence_half_samples);
        Self {
            bottleneck_threshold: finite_or(
                self.bottleneck_threshold,
                defaults.bottleneck_threshold,
            ),
            min_samples: self.min_samples,
            max_confidence: finite_or(self.max_confidence, defaults.max_confidence)
                .clamp(0.0, CONFIDENCE_CEILING),
            confidence_half_samples: if half > 0.0 {
                half
            } else {
                defaults.confidence_half_samples
            },
            fallback_penalty: finite_or(self.fallback_penalty, defaults.fallback_penalty)
                .clamp(0.0, 1.0),
            unknown_step_confidence_cap: finite_or(
                self.unknown_step_confidence_cap,
                defaults.unknown_step_confidence_cap,
            )
            .clamp(0.0, CONFIDENCE_CEILING),
        }
    }
}

/// Where a step's expected duration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    /// Mean of past runs
    History,
    /// The step's own `estimated_duration`
    Estimate,
    /// Extrapolated from elapsed time and progress
    Extrapolated,
    /// Nothing to go on
    Unknown,
}

/// Estimate for a single step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEstimate {
    /// Step id
    pub step_id: String,
    /// Expected total duration, if known
    pub expected_duration: Option<f64>,
    /// Where `expected_duration` came from
    pub source: EstimateSource,
    /// Historical samples behind the estimate
    pub samples: usize,
    /// Seconds still to go
    pub remaining: f64,
}

/// A running step that has overrun its expected duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    /// Step id
    pub step_id: String,
    /// Step title
    pub step_title: String,
    /// Expected duration in seconds
    pub expected_duration: f64,
    /// Time spent so far
    pub actual_duration_so_far: f64,
    /// `actual / expected - 1.0`; 0.30 means 30% over
    pub deviation_percent: f64,
    /// Threshold it was compared against
    pub threshold: f64,
}

/// Completion estimate for a running workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    /// Expected completion time
    pub eta: Timestamp,
    /// Seconds still to go
    pub estimated_remaining: f64,
    /// Confidence in `[0, max_confidence]`, never above 0.95
    pub confidence: f64,
    /// Overrunning steps, worst first
    pub bottlenecks: Vec<Bottleneck>,
    /// `elapsed + estimated_remaining`
    pub estimated_total: f64,
    /// Seconds since the workflow started
    pub elapsed: f64,
    /// Historical samples the estimate rests on
    pub based_on_samples: usize,
}

impl Estimate {
    /// The ETA as a chrono datetime.
    pub fn eta_datetime(&self) -> Option<DateTime<Utc>> {
        self.eta.to_datetime()
    }
}

/// Estimates remaining time from live state and history.
///
/// Stateless: neither the workflow nor the history is modified.
#[derive(Debug, Clone, Default)]
pub struct TimeEstimator {
    config: EstimatorConfig,
}

impl TimeEstimator {
    /// Create an estimator with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration. Out-of-range values are sanitized.
    pub fn with_config(mut self, config: EstimatorConfig) -> Self {
        let sanitized = config.sanitized();
        if sanitized != config {
            warn!("Estimator config adjusted to {:?}", sanitized);
        }
        self.config = sanitized;
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate completion as of now.
    pub fn estimate(
        &self,
        workflow: &impl AsRef<Workflow>,
        history: &WorkflowHistory,
        workflow_type: &str,
    ) -> Estimate {
        self.estimate_at(workflow, history, workflow_type, Timestamp::now())
    }

    /// Estimate completion as of `now`.
    pub fn estimate_at(
        &self,
        workflow: &impl AsRef<Workflow>,
        history: &WorkflowHistory,
        workflow_type: &str,
        now: Timestamp,
    ) -> Estimate {
        let workflow = workflow.as_ref();

        let mut remaining = 0.0;
        let mut samples = 0usize;
        let mut from_history = 0usize;
        let mut from_estimate = 0usize;
        let mut unknown_zero = false;

        for step in workflow.leaf_steps() {
            let est = self.step_estimate(step, history, workflow_type, now);
            remaining += est.remaining;
            match est.source {
                EstimateSource::History => {
                    from_history += 1;
                    samples += est.samples;
                }
                EstimateSource::Estimate => from_estimate += 1,
                EstimateSource::Extrapolated => {}
                EstimateSource::Unknown => {
                    if !step.state.is_terminal() {
                        unknown_zero = true;
                    }
                }
            }
        }

        let confidence = self.confidence(samples, from_history, from_estimate, unknown_zero);
        let elapsed = match workflow.started_at {
            Some(start) => workflow.ended_at.unwrap_or(now).seconds_since(start).max(0.0),
            None => 0.0,
        };
        let bottlenecks = self.bottlenecks_at(workflow, history, workflow_type, now);

        debug!(
            "Estimate for {}: {:.1}s remaining, confidence {:.2}, {} bottlenecks",
            workflow.workflow_id,
            remaining,
            confidence,
            bottlenecks.len()
        );

        Estimate {
            eta: now.offset(remaining),
            estimated_remaining: remaining,
            confidence,
            bottlenecks,
            estimated_total: elapsed + remaining,
            elapsed,
            based_on_samples: samples,
        }
    }

    /// Estimate for one step, or `None` if the step does not exist.
    pub fn estimate_step(
        &self,
        workflow: &impl AsRef<Workflow>,
        history: &WorkflowHistory,
        workflow_type: &str,
        step_id: &str,
        now: Timestamp,
    ) -> Option<StepEstimate> {
        let step = workflow.as_ref().step(step_id)?;
        Some(self.step_estimate(step, history, workflow_type, now))
    }

    /// Running steps that overran their expected duration, as of now.
    pub fn bottlenecks(
        &self,
        workflow: &impl AsRef<Workflow>,
        history: &WorkflowHistory,
        workflow_type: &str,
    ) -> Vec<Bottleneck> {
        self.bottlenecks_at(workflow.as_ref(), history, workflow_type, Timestamp::now())
    }

    /// Deviation of a running step from `expected`: `elapsed / expected - 1`.
    ///
    /// `None` for steps that are not running or when `expected` is not
    /// positive.
    pub fn detect_deviation(&self, step: &Step, expected: f64, now: Timestamp) -> Option<f64> {
        if !step.is_running() || !(expected > 0.0) {
            return None;
        }
        let elapsed = step.elapsed(now)?;
        Some(elapsed / expected - 1.0)
    }

    fn bottlenecks_at(
        &self,
        workflow: &Workflow,
        history: &WorkflowHistory,
        workflow_type: &str,
        now: Timestamp,
    ) -> Vec<Bottleneck> {
        let threshold = self.config.bottleneck_threshold;
        let mut found: Vec<Bottleneck> = workflow
            .ordered_steps()
            .filter(|s| s.is_running())
            .filter_map(|step| {
                let (expected, _, _) = self.expected_duration(step, history, workflow_type);
                let expected = expected?;
                let deviation = self.detect_deviation(step, expected, now)?;
                (deviation > threshold).then(|| Bottleneck {
                    step_id: step.id.clone(),
                    step_title: step.title.clone(),
                    expected_duration: expected,
                    actual_duration_so_far: step.elapsed(now).unwrap_or(0.0),
                    deviation_percent: deviation,
                    threshold,
                })
            })
            .collect();
        found.sort_by(|a, b| b.deviation_percent.total_cmp(&a.deviation_percent));
        found
    }

    /// Expected duration, its source and the sample count behind it.
    fn expected_duration(
        &self,
        step: &Step,
        history: &WorkflowHistory,
        workflow_type: &str,
    ) -> (Option<f64>, EstimateSource, usize) {
        let samples = history.step_samples(workflow_type, &step.id);
        if !samples.is_empty() && samples.len() >= self.config.min_samples {
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            return (Some(mean), EstimateSource::History, samples.len());
        }
        match step.estimated_duration {
            Some(d) if d > 0.0 => (Some(d), EstimateSource::Estimate, 0),
            _ => (None, EstimateSource::Unknown, 0),
        }
    }

    fn step_estimate(
        &self,
        step: &Step,
        history: &WorkflowHistory,
        workflow_type: &str,
        now: Timestamp,
    ) -> StepEstimate {
        let (expected, mut source, samples) = self.expected_duration(step, history, workflow_type);
        let fraction = step.progress_fraction;

        let remaining = match (step.state, expected) {
            (WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled, _) => 0.0,
            (WorkflowState::Pending, Some(expected)) => expected,
            (WorkflowState::InProgress | WorkflowState::Paused, Some(expected)) => {
                expected * (1.0 - fraction)
            }
            (WorkflowState::InProgress | WorkflowState::Paused, None) if fraction > 0.0 => {
                match step.elapsed(now) {
                    Some(elapsed) => {
                        source = EstimateSource::Extrapolated;
                        elapsed * (1.0 - fraction) / fraction
                    }
                    None => 0.0,
                }
            }
            (_, None) => 0.0,
        };

        StepEstimate {
            step_id: step.id.clone(),
            expected_duration: expected,
            source,
            samples,
            remaining: remaining.max(0.0),
        }
    }

    fn confidence(
        &self,
        samples: usize,
        from_history: usize,
        from_estimate: usize,
        unknown_zero: bool,
    ) -> f64 {
        if samples == 0 {
            return 0.0;
        }
        let cfg = &self.config;
        let n = samples as f64;
        let base = cfg.max_confidence * n / (n + cfg.confidence_half_samples);

        let h = from_history as f64;
        let e = from_estimate as f64;
        let coverage = (h + cfg.fallback_penalty * e) / (h + e);

        let mut confidence = base * coverage;
        if unknown_zero {
            confidence = confidence.min(cfg.unknown_step_confidence_cap);
        }
        if confidence.is_nan() {
            return 0.0;
        }
        confidence.max(0.0).min(cfg.max_confidence).min(CONFIDENCE_CEILING)
    }
}
